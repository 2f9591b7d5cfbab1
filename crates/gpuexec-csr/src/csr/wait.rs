use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use gpuexec_mem::{AllocationUsage, TaskCount};

use super::CommandStreamReceiver;
use crate::completion::{CompletionStamp, WaitStatus};
use crate::submission::SubmissionStatus;

impl CommandStreamReceiver {
    /// Wait until the device completes `task_count`.
    ///
    /// Submitted work without a completion fence gets one first, so the tag eventually reaches
    /// `task_count`. `None` waits forever.
    pub fn wait_for_task_count(&self, task_count: TaskCount, timeout: Option<Duration>) -> WaitStatus {
        self.stats.inc_waits();
        if CompletionStamp::is_sentinel(task_count) {
            return WaitStatus::NotReady;
        }
        if self.os_context.is_hang_detected() {
            self.report_hang(task_count);
            return WaitStatus::GpuHang;
        }

        if task_count > self.last_fenced.load(Ordering::Acquire) && task_count <= self.task_count() {
            let stamp = self.flush_tag_update();
            if !stamp.is_success() {
                tracing::warn!(
                    context_id = self.context_id(),
                    task_count,
                    status = ?stamp.failure_status(),
                    "could not fence pending work"
                );
                return WaitStatus::NotReady;
            }
        }

        let status = self.wait_for_completion_with_timeout(timeout, task_count);
        match status {
            WaitStatus::Ready => {}
            WaitStatus::NotReady => {
                self.stats.inc_wait_timeouts();
                tracing::debug!(
                    context_id = self.context_id(),
                    task_count,
                    completed = self.completed_task_count(),
                    "wait timed out"
                );
            }
            WaitStatus::GpuHang => self.report_hang(task_count),
        }
        status
    }

    /// Poll the completion tags without submitting anything.
    pub fn wait_for_completion_with_timeout(
        &self,
        timeout: Option<Duration>,
        task_count: TaskCount,
    ) -> WaitStatus {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut spins = 0u32;
        loop {
            if self.os_context.is_hang_detected() {
                return WaitStatus::GpuHang;
            }
            if self.tags.is_task_count_ready(task_count) {
                return WaitStatus::Ready;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return WaitStatus::NotReady;
            }
            if spins < self.config.wait_spin_count {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Wait for `task_count`, then free `usage` entries it covered.
    pub fn wait_for_task_count_and_clean_allocation_list(
        &self,
        task_count: TaskCount,
        usage: AllocationUsage,
    ) -> WaitStatus {
        let status = self.wait_for_task_count(task_count, self.default_wait_timeout());
        if status == WaitStatus::Ready {
            self.storage.clean_allocation_list(task_count, usage);
        }
        status
    }

    /// Also drains deferred frees the completed work was holding back.
    pub fn wait_for_task_count_and_clean_temporary_allocation_list(
        &self,
        task_count: TaskCount,
    ) -> WaitStatus {
        let status =
            self.wait_for_task_count_and_clean_allocation_list(task_count, AllocationUsage::Temporary);
        if status == WaitStatus::Ready {
            self.storage
                .clean_allocation_list(task_count, AllocationUsage::Deferred);
        }
        status
    }

    /// Prove the context works by completing one tag update, retrying while the device is not
    /// yet ready.
    pub fn initialize_device_with_first_submission(&self) -> SubmissionStatus {
        if self.task_count() > 0 {
            return SubmissionStatus::Success;
        }
        let context_id = self.context_id();
        for attempt in 0..=self.config.first_submission_retries {
            let stamp = self.flush_tag_update();
            match stamp.failure_status() {
                None => {}
                Some(SubmissionStatus::DeviceUninitialized) => {
                    tracing::debug!(context_id, attempt, "device not ready for first submission");
                    continue;
                }
                Some(status) => return status,
            }
            match self.wait_for_task_count(stamp.task_count, self.default_wait_timeout()) {
                WaitStatus::Ready => return SubmissionStatus::Success,
                WaitStatus::GpuHang => return SubmissionStatus::Failed,
                WaitStatus::NotReady => {
                    tracing::debug!(context_id, attempt, "first submission did not complete");
                }
            }
        }
        tracing::warn!(context_id, "first submission never completed");
        SubmissionStatus::DeviceUninitialized
    }

    fn report_hang(&self, task_count: TaskCount) {
        self.stats.inc_gpu_hangs();
        tracing::error!(
            context_id = self.context_id(),
            task_count,
            completed = self.completed_task_count(),
            "gpu hang detected"
        );
    }
}
