//! Equal-division static allocator. Grounded on
//! `allocators/static_allocator.py::StaticAllocator`.

use super::{static_allocation, AllocatorContext};
use crate::types::{AppId, NormAlloc};
use std::collections::BTreeMap;

pub fn allocate_and_parse(ctx: &AllocatorContext, app_ids: &[AppId]) -> BTreeMap<AppId, NormAlloc> {
    let vm_map = ctx.monitor.get_vm_to_app_mapping();
    static_allocation(&vm_map, app_ids, ctx.config.num_vms())
}
