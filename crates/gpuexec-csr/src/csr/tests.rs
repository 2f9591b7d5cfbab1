use std::sync::Arc;
use std::time::Duration;

use gpuexec_mem::{
    AllocationProperties, AllocationType, AllocationUsage, DeviceBitfield, GraphicsAllocation,
    MemoryError, MemoryManager,
};
use pretty_assertions::assert_eq;

use super::*;
use crate::command::{decode_all, Command};
use crate::completion::{CompletionStamp, WaitStatus};
use crate::config::CsrConfig;
use crate::direct_submission::RING_SEGMENT_BYTES;
use crate::error::CsrError;
use crate::factory::GfxFamily;
use crate::info::{get_info, CsrInfoParam, InfoError};
use crate::linear_stream::{HeapKind, LinearStream};
use crate::os_context::EngineType;
use crate::sim::ExecutionMode;
use crate::submission::SubmissionStatus;
use crate::test_support::{test_config, Harness};

fn buffer(mm: &MemoryManager, size: usize) -> Arc<GraphicsAllocation> {
    mm.allocate_graphics_memory_with_properties(&AllocationProperties::new(
        0,
        size,
        AllocationType::Buffer,
        DeviceBitfield::TILE0,
    ))
    .unwrap()
}

fn walker(args_address: u64) -> Command {
    Command::ComputeWalker {
        kernel_id: 1,
        groups: [1, 1, 1],
        args_address,
    }
}

fn is_state(command: &Command) -> bool {
    matches!(
        command,
        Command::PipelineSelect { .. }
            | Command::StateComputeMode(_)
            | Command::FrontEndState(_)
            | Command::StateBaseAddress(_)
            | Command::PreemptionControl { .. }
    )
}

fn flush_empty(csr: &CommandStreamReceiver) -> CompletionStamp {
    csr.flush(FlushPayload::Immediate(&[]), &[], &DispatchFlags::default())
}

#[test]
fn state_is_programmed_once_and_task_counts_advance() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let counter = buffer(&h.mm, 4096);
    let payload = [walker(counter.gpu_address())];
    let flags = DispatchFlags::default();

    let first = csr.flush(FlushPayload::Immediate(&payload), &[counter.clone()], &flags);
    let second = csr.flush(FlushPayload::Immediate(&payload), &[counter.clone()], &flags);
    assert_eq!(first.task_count, 1);
    assert_eq!(second.task_count, 2);
    assert!(second.flush_stamp > first.flush_stamp);
    assert_eq!(csr.completed_task_count(), 2);
    assert_eq!(csr.latest_sent_task_count(), 2);
    assert_eq!(counter.memory().read_u32(0).unwrap(), 2);

    let log = h.device.execution_log();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].commands.iter().filter(|c| is_state(c)).count(), 5);
    assert_eq!(log[1].commands.iter().filter(|c| is_state(c)).count(), 0);
}

#[test]
fn only_changed_state_is_reprogrammed() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    flush_empty(&csr);
    let flags = DispatchFlags {
        large_grf: true,
        ..DispatchFlags::default()
    };
    csr.flush(FlushPayload::Immediate(&[]), &[], &flags);

    let log = h.device.execution_log();
    let reprogrammed: Vec<_> = log[1].commands.iter().filter(|c| is_state(c)).collect();
    assert_eq!(reprogrammed.len(), 1);
    assert!(matches!(
        reprogrammed[0],
        Command::StateComputeMode(mode) if mode.large_grf
    ));
    assert_eq!(csr.stats().snapshot().compute_mode_emits, 2);
    assert!(csr.hardware_state().compute_mode.programmed().is_some_and(|m| m.large_grf));
}

#[test]
fn waiting_on_unfenced_work_submits_a_tag_update() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let flags = DispatchFlags {
        guard_completion: false,
        ..DispatchFlags::default()
    };
    let stamp = csr.flush(FlushPayload::Immediate(&[]), &[], &flags);
    assert_eq!(stamp.task_count, 1);
    assert_eq!(csr.completed_task_count(), 0);

    assert_eq!(
        csr.wait_for_task_count(1, Some(Duration::from_secs(1))),
        WaitStatus::Ready
    );
    assert_eq!(csr.task_count(), 2);
    assert_eq!(csr.stats().snapshot().tag_updates, 1);

    assert_eq!(
        csr.wait_for_task_count(1, Some(Duration::from_secs(1))),
        WaitStatus::Ready
    );
    assert_eq!(csr.stats().snapshot().tag_updates, 1);
}

#[test]
fn sentinel_task_counts_are_never_ready() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    assert_eq!(
        csr.wait_for_task_count(CompletionStamp::FAILED, Some(Duration::ZERO)),
        WaitStatus::NotReady
    );
    assert_eq!(csr.task_count(), 0);
}

#[test]
fn rejected_submission_leaves_no_trace() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let counter = buffer(&h.mm, 4096);
    let payload = [walker(counter.gpu_address())];

    h.device
        .fail_next_submissions(SubmissionStatus::OutOfMemory, 1);
    let stamp = csr.flush(
        FlushPayload::Immediate(&payload),
        &[counter.clone()],
        &DispatchFlags::default(),
    );
    assert_eq!(stamp.task_count, CompletionStamp::OUT_OF_DEVICE_MEMORY);
    assert_eq!(stamp.failure_status(), Some(SubmissionStatus::OutOfMemory));
    assert_eq!(csr.task_count(), 0);
    assert_eq!(csr.latest_sent_task_count(), 0);
    assert_eq!(csr.command_stream_used(), 0);
    assert!(!counter.is_used_by_context(csr.context_id()));
    assert!(!counter.is_resident(csr.context_id()));
    assert_eq!(csr.stats().snapshot().failed_submissions, 1);

    let stamp = csr.flush(
        FlushPayload::Immediate(&payload),
        &[counter.clone()],
        &DispatchFlags::default(),
    );
    assert_eq!(stamp.task_count, 1);
    let log = h.device.execution_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].commands.iter().filter(|c| is_state(c)).count(), 5);
    assert_eq!(counter.memory().read_u32(0).unwrap(), 1);
}

#[test]
fn blocking_flush_that_faults_reports_a_hang() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let flags = DispatchFlags {
        blocking: true,
        ..DispatchFlags::default()
    };
    let stamp = csr.flush(FlushPayload::Immediate(&[walker(0xdead_0000)]), &[], &flags);
    assert_eq!(stamp.task_count, CompletionStamp::GPU_HANG);
    assert_eq!(csr.task_count(), 1);
    assert!(h.device.execution_log()[0].fault.is_some());
    assert_eq!(
        csr.wait_for_task_count(1, Some(Duration::from_millis(10))),
        WaitStatus::GpuHang
    );
    assert!(csr.stats().snapshot().gpu_hangs >= 1);

    let after = flush_empty(&csr);
    assert_eq!(after.failure_status(), Some(SubmissionStatus::Failed));
    assert_eq!(csr.task_count(), 1);
}

#[test]
fn hang_is_reported_even_when_the_tag_already_passed() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    assert_eq!(flush_empty(&csr).task_count, 1);
    assert_eq!(csr.completed_task_count(), 1);

    h.device.inject_hang();
    assert_eq!(
        csr.wait_for_task_count(1, Some(Duration::from_millis(10))),
        WaitStatus::GpuHang
    );
    assert_eq!(
        csr.wait_for_task_count_and_clean_temporary_allocation_list(1),
        WaitStatus::GpuHang
    );
}

#[test]
fn deferred_free_is_released_by_a_completed_wait() {
    let h = Harness::new(ExecutionMode::Deferred);
    let csr = h.csr(GfxFamily::Gen12);
    let scratch = buffer(&h.mm, 4096);
    let stamp = csr.flush(FlushPayload::Immediate(&[]), &[scratch.clone()], &DispatchFlags::default());
    assert_eq!(stamp.task_count, 1);

    h.mm.check_gpu_usage_and_destroy(scratch.clone());
    let storage = csr.internal_allocation_storage();
    assert!(storage.contains(AllocationUsage::Deferred, scratch.id()));
    assert!(!scratch.is_freed());

    h.device.process_pending();
    assert_eq!(
        csr.wait_for_task_count_and_clean_temporary_allocation_list(1),
        WaitStatus::Ready
    );
    assert!(scratch.is_freed());
    assert!(storage.is_empty(AllocationUsage::Deferred));
}

#[test]
fn blocking_flush_releases_deferred_frees() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let scratch = buffer(&h.mm, 4096);
    csr.internal_allocation_storage()
        .store_allocation_with_task_count(scratch.clone(), AllocationUsage::Deferred, 1);

    let flags = DispatchFlags {
        blocking: true,
        ..DispatchFlags::default()
    };
    let stamp = csr.flush(FlushPayload::Immediate(&[]), &[], &flags);
    assert_eq!(stamp.task_count, 1);
    assert!(scratch.is_freed());
    assert!(csr
        .internal_allocation_storage()
        .is_empty(AllocationUsage::Deferred));
}

#[test]
fn residency_is_idempotent_and_released_after_submission() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let context_id = csr.context_id();
    let allocation = buffer(&h.mm, 4096);

    csr.make_resident(&allocation);
    csr.make_resident(&allocation);
    assert_eq!(csr.residency_allocations().len(), 1);

    let stamp = csr.flush(
        FlushPayload::Immediate(&[]),
        &[allocation.clone(), allocation.clone()],
        &DispatchFlags::default(),
    );
    assert_eq!(stamp.task_count, 1);

    let record = &h.device.execution_log()[0];
    assert_eq!(
        record.residency.iter().filter(|id| **id == allocation.id()).count(),
        1
    );
    assert!(record.residency.contains(&csr.tag_allocation().id()));
    assert_eq!(allocation.task_count(context_id), 1);
    assert!(!allocation.is_resident(context_id));
    assert!(csr.residency_allocations().is_empty());
    assert!(h.device.evictions().contains(&(context_id, allocation.id())));
}

#[test]
fn non_evictable_allocations_are_not_queued_for_eviction() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let evictable = buffer(&h.mm, 4096);
    let pinned = buffer(&h.mm, 4096);
    pinned.set_evictable(false);

    csr.make_resident(&evictable);
    csr.make_resident(&pinned);
    csr.make_non_resident(&evictable);
    csr.make_non_resident(&pinned);

    assert!(csr.residency_allocations().is_empty());
    let evictions: Vec<_> = csr.eviction_allocations().iter().map(|a| a.id()).collect();
    assert_eq!(evictions, vec![evictable.id()]);
    assert!(pinned.is_evictable());

    csr.process_eviction();
    assert!(csr.eviction_allocations().is_empty());
    assert_eq!(
        h.device.evictions(),
        vec![(csr.context_id(), evictable.id())]
    );
}

#[test]
fn caller_stream_is_chained_and_fenced() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let counter = buffer(&h.mm, 4096);
    let mut stream = LinearStream::new(buffer(&h.mm, 4096));
    stream.write_command(walker(counter.gpu_address())).unwrap();

    let stamp = csr.flush(
        FlushPayload::Stream {
            stream: &mut stream,
            start_offset: 0,
        },
        &[counter.clone()],
        &DispatchFlags::default(),
    );
    assert_eq!(stamp.task_count, 1);
    assert_eq!(counter.memory().read_u32(0).unwrap(), 1);
    assert_eq!(csr.completed_task_count(), 1);

    let commands = decode_all(&stream.read_dwords(0, stream.used()).unwrap()).unwrap();
    assert_eq!(commands.len(), 3);
    assert!(matches!(
        commands[1],
        Command::PipeControl {
            post_sync: Some(post_sync),
            ..
        } if post_sync.address == csr.tag_address() && post_sync.value == 1
    ));
    assert_eq!(commands[2], Command::BatchBufferEnd);
}

#[test]
fn rejected_stream_submission_rewinds_the_caller_stream() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let mut stream = LinearStream::new(buffer(&h.mm, 4096));
    stream.write_command(Command::Noop).unwrap();
    let used = stream.used();

    h.device.fail_next_submissions(SubmissionStatus::Failed, 1);
    let stamp = csr.flush(
        FlushPayload::Stream {
            stream: &mut stream,
            start_offset: 0,
        },
        &[],
        &DispatchFlags::default(),
    );
    assert_eq!(stamp.task_count, CompletionStamp::FAILED);
    assert_eq!(stream.used(), used);
}

#[test]
fn direct_submission_dispatches_through_the_ring() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::XeHpc);
    let stamp = flush_empty(&csr);
    assert_eq!(stamp.task_count, 1);
    assert!(csr.is_direct_submission_enabled());
    assert!(h.device.execution_log()[0].direct_submission);
    assert_eq!(csr.completed_task_count(), 1);
    assert_eq!(csr.stats().snapshot().direct_submission_dispatches, 1);
}

#[test]
fn unsupported_engine_falls_back_to_discrete_submissions() {
    let h = Harness::new(ExecutionMode::Immediate);
    h.device
        .set_direct_submission_supported(EngineType::Compute, false);
    let csr = h.csr(GfxFamily::XeHpc);
    assert_eq!(flush_empty(&csr).task_count, 1);
    assert!(!csr.is_direct_submission_enabled());
    assert!(!h.device.execution_log()[0].direct_submission);
    assert_eq!(csr.completed_task_count(), 1);
}

#[test]
fn full_ring_switches_to_the_idle_ring() {
    let h = Harness::new(ExecutionMode::Immediate);
    let config = CsrConfig {
        direct_submission: Some(true),
        direct_submission_ring_size: RING_SEGMENT_BYTES,
        ..test_config()
    };
    let csr = h.csr_with(GfxFamily::Gen12, DeviceBitfield::TILE0, config);
    for expected in 1..=3 {
        assert_eq!(flush_empty(&csr).task_count, expected);
    }
    assert_eq!(csr.completed_task_count(), 3);
    assert_eq!(csr.stats().snapshot().direct_submission_ring_switches, 2);
}

#[test]
fn ring_switch_after_unfenced_flushes_does_not_stall() {
    let h = Harness::new(ExecutionMode::Immediate);
    let config = CsrConfig {
        direct_submission: Some(true),
        direct_submission_ring_size: RING_SEGMENT_BYTES,
        default_wait_timeout_ms: Some(300),
        ..test_config()
    };
    let csr = h.csr_with(GfxFamily::Gen12, DeviceBitfield::TILE0, config);
    let flags = DispatchFlags {
        guard_completion: false,
        ..DispatchFlags::default()
    };

    let stamps: Vec<_> = (0..3)
        .map(|_| {
            csr.flush(FlushPayload::Immediate(&[]), &[], &flags)
                .task_count
        })
        .collect();
    assert_eq!(stamps, vec![1, 2, 3]);
    assert_eq!(csr.completed_task_count(), 3);
    assert_eq!(csr.stats().snapshot().direct_submission_ring_switches, 2);
    assert_eq!(csr.stats().snapshot().failed_submissions, 0);

    let log = h.device.execution_log();
    assert!(log.iter().all(|record| record.direct_submission));
    assert!(log[0].commands.iter().any(|c| matches!(
        c,
        Command::PipeControl { post_sync: Some(post_sync), .. } if post_sync.value == 1
    )));
}

#[test]
fn stopping_direct_submission_retires_the_rings() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::XeHpc);
    flush_empty(&csr);
    csr.stop_direct_submission();
    assert!(!csr.is_direct_submission_enabled());
    assert_eq!(
        csr.internal_allocation_storage()
            .len(AllocationUsage::Temporary),
        2
    );
    assert_eq!(flush_empty(&csr).task_count, 2);
    assert!(!h.device.execution_log()[1].direct_submission);
}

#[test]
fn heapless_receivers_have_no_indirect_heaps() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Xe2);
    assert!(csr.is_heapless());
    assert!(matches!(
        csr.get_indirect_heap(HeapKind::SurfaceState, 0),
        Err(CsrError::HeaplessHeap(HeapKind::SurfaceState))
    ));

    assert_eq!(flush_empty(&csr).task_count, 1);
    assert!(csr.global_stateless_heap().is_some());
    assert!(!h.device.execution_log()[0]
        .commands
        .iter()
        .any(|c| matches!(c, Command::StateBaseAddress(_))));
}

#[test]
fn heapless_can_be_disabled_by_config() {
    let h = Harness::new(ExecutionMode::Immediate);
    let config = CsrConfig {
        heapless: Some(false),
        ..test_config()
    };
    let csr = h.csr_with(GfxFamily::Xe2, DeviceBitfield::TILE0, config);
    assert!(!csr.is_heapless());
    assert!(csr.get_indirect_heap(HeapKind::DynamicState, 0).is_ok());
}

#[test]
fn growing_a_heap_retires_the_old_one_and_reprograms_base_addresses() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);

    let heap = csr.get_indirect_heap(HeapKind::SurfaceState, 1000).unwrap();
    assert_eq!(heap.allocation.size(), 64 * 1024);
    assert_eq!(heap.max_available, 64 * 1024 - 4096);
    let same = csr.get_indirect_heap(HeapKind::SurfaceState, 2000).unwrap();
    assert_eq!(same.allocation.id(), heap.allocation.id());

    flush_empty(&csr);
    let first = &h.device.execution_log()[0];
    assert!(first.commands.iter().any(|c| matches!(
        c,
        Command::StateBaseAddress(bases) if bases.surface_state == heap.gpu_base()
    )));
    assert!(first
        .commands
        .iter()
        .any(|c| matches!(c, Command::BindingTablePoolAlloc { .. })));

    let bigger = csr
        .get_indirect_heap(HeapKind::SurfaceState, 100_000)
        .unwrap();
    assert_ne!(bigger.allocation.id(), heap.allocation.id());
    assert!(bigger.max_available >= 100_000);
    assert!(csr
        .internal_allocation_storage()
        .contains(AllocationUsage::Reusable, heap.allocation.id()));

    flush_empty(&csr);
    let second = &h.device.execution_log()[1];
    let sba = second
        .commands
        .iter()
        .position(|c| matches!(c, Command::StateBaseAddress(bases) if bases.surface_state == bigger.gpu_base()))
        .unwrap();
    assert!(matches!(second.commands[sba - 1], Command::PipeControl { .. }));
}

#[test]
fn preallocation_fills_the_reuse_list_once() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let storage = csr.internal_allocation_storage();

    csr.request_preallocation();
    assert_eq!(storage.len(AllocationUsage::Reusable), 2);
    csr.request_preallocation();
    assert_eq!(storage.len(AllocationUsage::Reusable), 2);
    assert_eq!(csr.preallocation_requests(), 2);
    assert_eq!(csr.stats().snapshot().preallocated_command_buffers, 2);

    csr.release_preallocation_request();
    csr.release_preallocation_request();
    csr.release_preallocation_request();
    assert_eq!(csr.preallocation_requests(), 0);

    flush_empty(&csr);
    let stats = csr.stats().snapshot();
    assert_eq!(stats.command_buffer_reuses, 1);
    assert_eq!(stats.command_buffer_allocations, 0);
}

#[test]
fn exhausted_command_buffer_is_replaced_and_later_reused() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let payload = vec![Command::Noop; 12_000];

    flush_empty(&csr);
    let first = csr.command_buffer().unwrap();
    csr.flush(FlushPayload::Immediate(&payload), &[], &DispatchFlags::default());
    csr.flush(FlushPayload::Immediate(&payload), &[], &DispatchFlags::default());
    let second = csr.command_buffer().unwrap();
    assert_ne!(first.id(), second.id());

    csr.flush(FlushPayload::Immediate(&payload), &[], &DispatchFlags::default());
    assert_eq!(csr.command_buffer().unwrap().id(), first.id());
    assert_eq!(csr.completed_task_count(), 4);

    let stats = csr.stats().snapshot();
    assert_eq!(stats.command_buffer_allocations, 2);
    assert_eq!(stats.command_buffer_reuses, 1);
}

#[test]
fn scratch_growth_reprograms_front_end_and_retires_old_scratch() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let flags = |scratch_per_thread| DispatchFlags {
        scratch_per_thread,
        ..DispatchFlags::default()
    };

    csr.flush(FlushPayload::Immediate(&[]), &[], &flags(1024));
    let small = csr.scratch_allocation().unwrap();
    csr.flush(FlushPayload::Immediate(&[]), &[], &flags(512));
    assert_eq!(csr.scratch_allocation().unwrap().id(), small.id());
    csr.flush(FlushPayload::Immediate(&[]), &[], &flags(4096));
    let large = csr.scratch_allocation().unwrap();
    assert_ne!(large.id(), small.id());
    assert!(csr
        .internal_allocation_storage()
        .contains(AllocationUsage::Temporary, small.id()));

    let log = h.device.execution_log();
    assert!(!log[1].commands.iter().any(|c| matches!(c, Command::FrontEndState(_))));
    assert!(log[2].commands.iter().any(|c| matches!(
        c,
        Command::FrontEndState(fe) if fe.scratch_address == large.gpu_address() && fe.per_thread_scratch_size == 4096
    )));
}

#[test]
fn host_surface_allocation_is_temporary_until_its_submission_completes() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    let context_id = csr.context_id();
    let storage = csr.internal_allocation_storage();

    let mut surface = HostPtrSurface::new(0x10_0000, 4096);
    csr.create_allocation_for_host_surface(&mut surface).unwrap();
    let allocation = surface.allocation().unwrap().clone();
    assert_eq!(allocation.task_count(context_id), CompletionStamp::NOT_READY);
    assert_eq!(allocation.allocation_type(), AllocationType::ExternalHostPtr);

    let mut again = HostPtrSurface::new(0x10_0000, 4096);
    csr.create_allocation_for_host_surface(&mut again).unwrap();
    assert_eq!(again.allocation().unwrap().id(), allocation.id());
    assert_eq!(storage.len(AllocationUsage::Temporary), 1);

    let flags = DispatchFlags {
        blocking: true,
        ..DispatchFlags::default()
    };
    let stamp = csr.flush(FlushPayload::Immediate(&[]), &[allocation.clone()], &flags);
    assert_eq!(stamp.task_count, 1);
    assert!(!storage.contains(AllocationUsage::Temporary, allocation.id()));
    assert!(allocation.is_freed());
}

#[test]
fn unmappable_host_surface_falls_back_to_a_copy() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    h.backend.set_fail_os_handle_population(true);

    let mut plain = HostPtrSurface::new(0x20_0000, 4096);
    assert!(matches!(
        csr.create_allocation_for_host_surface(&mut plain),
        Err(CsrError::Memory(MemoryError::OutOfHostMemory))
    ));
    assert!(plain.allocation().is_none());

    let data = vec![0xabu8; 4096];
    let mut copied = HostPtrSurface::new(0x20_0000, 4096).with_copy(data.clone());
    csr.create_allocation_for_host_surface(&mut copied).unwrap();
    let allocation = copied.allocation().unwrap();
    assert_eq!(allocation.allocation_type(), AllocationType::InternalHostMemory);
    let mut contents = vec![0u8; 4096];
    allocation.memory().read_bytes(0, &mut contents).unwrap();
    assert_eq!(contents, data);
}

#[test]
fn context_creation_failure_is_reported_and_retried() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    h.device.fail_context_initialization(csr.context_id(), 1);

    let stamp = flush_empty(&csr);
    assert_eq!(stamp.task_count, CompletionStamp::DEVICE_UNINITIALIZED);
    assert_eq!(csr.task_count(), 0);
    assert_eq!(flush_empty(&csr).task_count, 1);
}

#[test]
fn first_submission_retries_until_the_device_is_ready() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    h.device.fail_context_initialization(csr.context_id(), 2);
    assert_eq!(
        csr.initialize_device_with_first_submission(),
        SubmissionStatus::Success
    );
    assert_eq!(csr.completed_task_count(), 1);
    assert_eq!(
        csr.initialize_device_with_first_submission(),
        SubmissionStatus::Success
    );
    assert_eq!(csr.task_count(), 1);

    let stubborn = h.csr(GfxFamily::Gen12);
    h.device.fail_context_initialization(stubborn.context_id(), 100);
    assert_eq!(
        stubborn.initialize_device_with_first_submission(),
        SubmissionStatus::DeviceUninitialized
    );
}

#[test]
fn completion_waits_for_the_slowest_partition() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr_with(GfxFamily::XeHpc, DeviceBitfield::first_tiles(2), test_config());
    assert_eq!(csr.active_partitions(), 2);

    h.device.stall_partition(1);
    assert_eq!(flush_empty(&csr).task_count, 1);
    assert_eq!(csr.tag_store().read(0), 1);
    assert_eq!(csr.completed_task_count(), 0);
    assert_eq!(
        csr.wait_for_task_count(1, Some(Duration::from_millis(20))),
        WaitStatus::NotReady
    );

    h.device.release_partition(1);
    assert_eq!(
        csr.wait_for_task_count(1, Some(Duration::from_secs(1))),
        WaitStatus::Ready
    );
    assert!(h.device.execution_log()[0]
        .commands
        .iter()
        .any(|c| matches!(c, Command::WorkPartitionRegister { .. })));
}

#[test]
fn semaphore_dependency_orders_work_across_receivers() {
    let h = Harness::new(ExecutionMode::Immediate);
    let producer = h.csr(GfxFamily::Gen12);
    let consumer = h.csr(GfxFamily::Gen12);
    let counter = buffer(&h.mm, 4096);

    let flags = DispatchFlags {
        dependencies: producer.completion_dependencies(1),
        ..DispatchFlags::default()
    };
    let stamp = consumer.flush(
        FlushPayload::Immediate(&[walker(counter.gpu_address())]),
        &[counter.clone(), producer.tag_allocation().clone()],
        &flags,
    );
    assert_eq!(stamp.task_count, 1);
    assert_eq!(consumer.completed_task_count(), 0);
    assert_eq!(h.device.pending_batches(), 1);

    flush_empty(&producer);
    assert_eq!(
        consumer.wait_for_task_count(1, Some(Duration::from_secs(1))),
        WaitStatus::Ready
    );
    assert_eq!(counter.memory().read_u32(0).unwrap(), 1);
}

#[test]
fn info_queries_copy_out_little_endian_values() {
    let h = Harness::new(ExecutionMode::Immediate);
    let csr = h.csr(GfxFamily::Gen12);
    flush_empty(&csr);

    let mut out = [0u8; 8];
    assert_eq!(get_info(&csr, CsrInfoParam::TaskCount, &mut out), Ok(4));
    assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), 1);
    assert_eq!(get_info(&csr, CsrInfoParam::TagAddress, &mut out), Ok(8));
    assert_eq!(u64::from_le_bytes(out), csr.tag_address());

    let mut small = [0u8; 4];
    assert_eq!(
        get_info(&csr, CsrInfoParam::TagAddress, &mut small),
        Err(InfoError::BufferTooSmall {
            param: CsrInfoParam::TagAddress,
            needed: 8,
            provided: 4
        })
    );
}

#[test]
fn dropping_the_receiver_releases_everything_it_owns() {
    let h = Harness::new(ExecutionMode::Immediate);
    {
        let csr = h.csr(GfxFamily::XeHpc);
        csr.request_preallocation();
        csr.get_indirect_heap(HeapKind::DynamicState, 0).unwrap();
        let flags = DispatchFlags {
            blocking: true,
            scratch_per_thread: 2048,
            uses_ray_tracing: true,
            ..DispatchFlags::default()
        };
        assert_eq!(
            csr.flush(FlushPayload::Immediate(&[]), &[], &flags).task_count,
            1
        );
        assert!(h.mm.live_allocation_count() > 0);
    }
    assert_eq!(h.mm.live_allocation_count(), 0);
    assert!(h.mm.registered_engines().is_empty());
}
