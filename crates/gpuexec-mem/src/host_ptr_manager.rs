//! Page-granular registration of host memory ranges for device access.
//!
//! The device can only map host memory in whole pages, while applications hand the driver
//! arbitrary byte ranges. A range is decomposed into at most three page-aligned fragments
//! (a leading page, a run of middle pages and a trailing page). Fragments are shared between
//! every allocation whose range touches them and are reference counted, so two buffers that
//! share a page also share the OS mapping of that page.
//!
//! The fragment table is the one structure that command stream receivers on different
//! engines mutate concurrently, so every table operation runs under a single mutex.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::backend::MemoryBackend;
use crate::error::{MemoryError, Result};
use crate::{align_down, align_up, lock, PAGE_SIZE};

pub const MAX_FRAGMENTS_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentPosition {
    #[default]
    None,
    Leading,
    Middle,
    Trailing,
}

/// One page-aligned piece of a host range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationFragment {
    pub ptr: u64,
    pub size: usize,
    pub position: FragmentPosition,
}

/// Decomposition of a host range into fragments.
///
/// Fragments are packed from index 0; the capacity of three is a property of the
/// decomposition, not an implementation limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequirements {
    pub root_device_index: u32,
    pub fragments: [Option<AllocationFragment>; MAX_FRAGMENTS_COUNT],
    pub total_required_size: usize,
}

impl AllocationRequirements {
    pub fn required_fragments_count(&self) -> usize {
        self.fragments.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AllocationFragment> {
        self.fragments.iter().flatten()
    }
}

/// OS-level mapping handle for one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OsHandle(pub u64);

/// A fragment as stored in the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentStorage {
    pub cpu_ptr: u64,
    pub size: usize,
    pub ref_count: i32,
    pub os_handle: Option<OsHandle>,
    pub driver_allocation: bool,
}

impl FragmentStorage {
    pub fn new(cpu_ptr: u64, size: usize) -> Self {
        Self {
            cpu_ptr,
            size,
            ref_count: 0,
            os_handle: None,
            driver_allocation: false,
        }
    }

    fn end(&self) -> u64 {
        self.cpu_ptr.saturating_add(self.size as u64)
    }
}

/// Per-allocation view of the fragments backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentSlot {
    pub cpu_ptr: u64,
    pub size: usize,
    pub os_handle: Option<OsHandle>,
    /// Set on release when this allocation dropped the last reference to the fragment.
    pub free_the_fragment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsHandleStorage {
    pub slots: [Option<FragmentSlot>; MAX_FRAGMENTS_COUNT],
}

impl OsHandleStorage {
    pub fn fragment_count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FragmentSlot> {
        self.slots.iter().flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapStatus {
    NotOverlapping,
    /// The query lies strictly inside a stored fragment.
    Within,
    /// The query has exactly the bounds of a stored fragment.
    ExactSize,
    /// The query extends past a stored fragment, or a stored fragment starts inside it.
    OverlappingAndBigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequirementsStatus {
    Success,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPtrEntryKey {
    pub root_device_index: u32,
    pub ptr: u64,
}

impl HostPtrEntryKey {
    pub fn new(root_device_index: u32, ptr: u64) -> Self {
        Self {
            root_device_index,
            ptr,
        }
    }
}

/// Drains completed temporary allocations so conflicting fragments can be released.
pub trait TemporaryAllocationCleaner {
    fn clean_temporary_allocation_list_on_all_engines(&self, wait_for_completion: bool);
}

type FragmentMap = BTreeMap<HostPtrEntryKey, FragmentStorage>;

#[derive(Debug, Default)]
pub struct HostPtrManager {
    fragments: Mutex<FragmentMap>,
    preparation: Mutex<()>,
}

impl HostPtrManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split `[ptr, ptr + size)` into page-aligned fragments.
    pub fn get_allocation_requirements(
        root_device_index: u32,
        ptr: u64,
        size: usize,
    ) -> AllocationRequirements {
        let page = PAGE_SIZE as u64;
        let offset_in_page = ptr % page;
        let whole_size = align_up((size as u64).saturating_add(offset_in_page), page);

        let mut fragments = [None; MAX_FRAGMENTS_COUNT];
        let mut count = 0;

        let aligned_start = align_down(ptr, page);
        let leading_needed = aligned_start != ptr;
        if leading_needed {
            fragments[count] = Some(AllocationFragment {
                ptr: aligned_start,
                size: PAGE_SIZE,
                position: FragmentPosition::Leading,
            });
            count += 1;
        }

        let end = ptr.saturating_add(size as u64);
        let aligned_end = align_down(end, page);
        let trailing_needed = aligned_end != end && aligned_end != aligned_start;

        let edge_pages = u64::from(leading_needed) + u64::from(trailing_needed);
        let middle_size = whole_size.saturating_sub(edge_pages * page);
        if middle_size != 0 {
            fragments[count] = Some(AllocationFragment {
                ptr: align_up(ptr, page),
                size: middle_size as usize,
                position: FragmentPosition::Middle,
            });
            count += 1;
        }

        if trailing_needed {
            fragments[count] = Some(AllocationFragment {
                ptr: aligned_end,
                size: PAGE_SIZE,
                position: FragmentPosition::Trailing,
            });
        }

        AllocationRequirements {
            root_device_index,
            fragments,
            total_required_size: whole_size as usize,
        }
    }

    pub fn get_fragment_count(&self) -> usize {
        lock(&self.fragments).len()
    }

    /// The stored fragment containing `key.ptr` on `key.root_device_index`, if any.
    pub fn get_fragment(&self, key: HostPtrEntryKey) -> Option<FragmentStorage> {
        let map = lock(&self.fragments);
        find_element(&map, key).map(|(_, fragment)| fragment.clone())
    }

    pub fn get_fragment_and_check_for_overlaps(
        &self,
        root_device_index: u32,
        ptr: u64,
        size: usize,
    ) -> (Option<FragmentStorage>, OverlapStatus) {
        let map = lock(&self.fragments);
        let (found, status) = check_for_overlaps(&map, HostPtrEntryKey::new(root_device_index, ptr), size);
        (found.map(|(_, fragment)| fragment.clone()), status)
    }

    /// Insert `fragment`, or take another reference if its key is already present.
    pub fn store_fragment(&self, root_device_index: u32, fragment: FragmentStorage) {
        let mut map = lock(&self.fragments);
        store_locked(&mut map, root_device_index, fragment);
    }

    /// Drop one reference to the fragment at `ptr`. Returns true when that was the last one
    /// and the entry has been erased; the caller then owns freeing the OS mapping.
    pub fn release_host_ptr(&self, root_device_index: u32, ptr: u64) -> bool {
        let mut map = lock(&self.fragments);
        release_locked(&mut map, HostPtrEntryKey::new(root_device_index, ptr))
    }

    pub fn release_handle_storage(&self, root_device_index: u32, storage: &mut OsHandleStorage) {
        let mut map = lock(&self.fragments);
        for slot in storage.slots.iter_mut().flatten() {
            slot.free_the_fragment =
                release_locked(&mut map, HostPtrEntryKey::new(root_device_index, slot.cpu_ptr));
        }
    }

    /// Take references on the fragments of `requirements` that are already registered.
    ///
    /// Slots whose range is not registered are left without an OS handle for the caller to
    /// populate and then store. A range that only partially overlaps registered fragments is a
    /// sequencing error: the references taken so far are dropped again and the call fails.
    pub fn populate_already_allocated_fragments(
        &self,
        requirements: &AllocationRequirements,
    ) -> Result<OsHandleStorage> {
        let root = requirements.root_device_index;
        let mut map = lock(&self.fragments);
        let mut storage = OsHandleStorage::default();
        let mut referenced = Vec::with_capacity(MAX_FRAGMENTS_COUNT);

        for (index, fragment) in requirements.fragments.iter().enumerate() {
            let Some(fragment) = fragment else {
                continue;
            };
            let key = HostPtrEntryKey::new(root, fragment.ptr);
            let (found, status) = check_for_overlaps(&map, key, fragment.size);
            let found_key = found.map(|(k, _)| k);
            match (status, found_key) {
                (OverlapStatus::Within | OverlapStatus::ExactSize, Some(found_key)) => {
                    let Some(stored) = map.get_mut(&found_key) else {
                        continue;
                    };
                    stored.ref_count += 1;
                    referenced.push(found_key);
                    storage.slots[index] = Some(FragmentSlot {
                        cpu_ptr: fragment.ptr,
                        size: fragment.size,
                        os_handle: stored.os_handle,
                        free_the_fragment: false,
                    });
                }
                (OverlapStatus::OverlappingAndBigger, _) => {
                    for key in referenced {
                        release_locked(&mut map, key);
                    }
                    return Err(MemoryError::HostPtrOverlap {
                        ptr: fragment.ptr,
                        size: fragment.size,
                    });
                }
                _ => {
                    storage.slots[index] = Some(FragmentSlot {
                        cpu_ptr: fragment.ptr,
                        size: fragment.size,
                        os_handle: None,
                        free_the_fragment: false,
                    });
                }
            }
        }
        Ok(storage)
    }

    /// Resolve every fragment of `requirements` that conflicts with the table.
    ///
    /// A conflicting fragment usually belongs to a temporary allocation whose submission has
    /// completed but has not been reclaimed yet, so completed temporaries are cleaned first;
    /// if that is not enough every engine is waited on and cleaned again. A conflict that
    /// survives both passes means some engine never finished with the fragment.
    pub fn check_allocations_for_overlapping(
        &self,
        cleaner: &dyn TemporaryAllocationCleaner,
        requirements: &AllocationRequirements,
    ) -> RequirementsStatus {
        let root = requirements.root_device_index;
        for fragment in requirements.iter() {
            let overlapping = || {
                let (_, status) = self.get_fragment_and_check_for_overlaps(root, fragment.ptr, fragment.size);
                status == OverlapStatus::OverlappingAndBigger
            };
            if !overlapping() {
                continue;
            }

            cleaner.clean_temporary_allocation_list_on_all_engines(false);
            if !overlapping() {
                continue;
            }

            tracing::debug!(
                ptr = fragment.ptr,
                size = fragment.size,
                "host pointer overlap persists; waiting for all engines"
            );
            cleaner.clean_temporary_allocation_list_on_all_engines(true);
            if overlapping() {
                tracing::error!(
                    ptr = fragment.ptr,
                    size = fragment.size,
                    "host pointer fragment still in use after waiting"
                );
                return RequirementsStatus::Fatal;
            }
        }
        RequirementsStatus::Success
    }

    /// Full registration path for a new host-pointer allocation.
    ///
    /// On success every slot of the returned storage holds an OS handle and one reference on
    /// its fragment. On failure no references are left behind.
    pub fn prepare_os_storage_for_allocation(
        &self,
        cleaner: &dyn TemporaryAllocationCleaner,
        backend: &dyn MemoryBackend,
        size: usize,
        ptr: u64,
        root_device_index: u32,
    ) -> Result<OsHandleStorage> {
        let _preparation = lock(&self.preparation);

        let requirements = Self::get_allocation_requirements(root_device_index, ptr, size);
        if self.check_allocations_for_overlapping(cleaner, &requirements) == RequirementsStatus::Fatal {
            return Err(MemoryError::HostPtrOverlap { ptr, size });
        }

        let mut storage = self.populate_already_allocated_fragments(&requirements)?;
        let new_slots: Vec<usize> = storage
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.filter(|s| s.os_handle.is_none()).map(|_| i))
            .collect();

        if let Err(err) = backend.populate_os_handles(&mut storage, root_device_index) {
            let mut created = OsHandleStorage::default();
            let mut map = lock(&self.fragments);
            for (index, slot) in storage.slots.iter().enumerate() {
                let Some(slot) = slot else {
                    continue;
                };
                if new_slots.contains(&index) {
                    if slot.os_handle.is_some() {
                        created.slots[index] = Some(FragmentSlot {
                            free_the_fragment: true,
                            ..*slot
                        });
                    }
                } else {
                    release_locked(&mut map, HostPtrEntryKey::new(root_device_index, slot.cpu_ptr));
                }
            }
            drop(map);
            backend.clean_os_handles(&created, root_device_index);
            return Err(err);
        }

        let mut map = lock(&self.fragments);
        for index in new_slots {
            let Some(slot) = storage.slots[index] else {
                continue;
            };
            let Some(handle) = slot.os_handle else {
                return Err(MemoryError::MissingFragment {
                    root_device_index,
                    ptr: slot.cpu_ptr,
                });
            };
            store_locked(
                &mut map,
                root_device_index,
                FragmentStorage {
                    cpu_ptr: slot.cpu_ptr,
                    size: slot.size,
                    ref_count: 0,
                    os_handle: Some(handle),
                    driver_allocation: true,
                },
            );
        }
        Ok(storage)
    }
}

fn find_element(map: &FragmentMap, key: HostPtrEntryKey) -> Option<(HostPtrEntryKey, &FragmentStorage)> {
    if let Some(fragment) = map.get(&key) {
        return Some((key, fragment));
    }
    let (prev_key, prev) = map.range(..key).next_back()?;
    if prev_key.root_device_index != key.root_device_index {
        return None;
    }
    // A zero-sized fragment only answers to its own pointer.
    let end = if prev.size == 0 { prev.cpu_ptr + 1 } else { prev.end() };
    (key.ptr < end).then_some((*prev_key, prev))
}

fn check_for_overlaps(
    map: &FragmentMap,
    key: HostPtrEntryKey,
    size: usize,
) -> (Option<(HostPtrEntryKey, &FragmentStorage)>, OverlapStatus) {
    let requested_end = key.ptr.saturating_add(size as u64);

    if let Some((found_key, stored)) = find_element(map, key) {
        let contains = stored.cpu_ptr <= key.ptr && requested_end <= stored.end();
        if !contains {
            return (None, OverlapStatus::OverlappingAndBigger);
        }
        let status = if stored.cpu_ptr == key.ptr && stored.size == size {
            OverlapStatus::ExactSize
        } else {
            OverlapStatus::Within
        };
        return (Some((found_key, stored)), status);
    }

    if size == 0 {
        return (None, OverlapStatus::NotOverlapping);
    }
    let upper = HostPtrEntryKey::new(key.root_device_index, requested_end);
    let starts_inside = map
        .range((Bound::Excluded(key), Bound::Excluded(upper)))
        .next()
        .is_some();
    if starts_inside {
        (None, OverlapStatus::OverlappingAndBigger)
    } else {
        (None, OverlapStatus::NotOverlapping)
    }
}

fn store_locked(map: &mut FragmentMap, root_device_index: u32, mut fragment: FragmentStorage) {
    let key = HostPtrEntryKey::new(root_device_index, fragment.cpu_ptr);
    if let Some(existing) = map.get_mut(&key) {
        existing.ref_count += 1;
        return;
    }
    fragment.ref_count += 1;
    map.insert(key, fragment);
}

fn release_locked(map: &mut FragmentMap, key: HostPtrEntryKey) -> bool {
    let Some(fragment) = map.get_mut(&key) else {
        tracing::warn!(
            root_device_index = key.root_device_index,
            ptr = key.ptr,
            "release of unregistered host pointer fragment"
        );
        return false;
    };
    fragment.ref_count -= 1;
    if fragment.ref_count <= 0 {
        map.remove(&key);
        return true;
    }
    false
}
