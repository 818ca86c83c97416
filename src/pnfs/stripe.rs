//! Offset to stripe to storage node. Layout grant, device info and the
//! data-server path all go through here.

use crate::backend::{Backend, StripeLayout, VInode};
use crate::error::Result;

/// Stripe holding byte `offset` for stripes `width` bytes wide.
pub fn stripe_index(offset: u64, width: u32) -> u64 {
    offset / width as u64
}

/// Offset of `offset` from the start of its stripe.
pub fn offset_in_stripe(offset: u64, width: u32) -> u64 {
    offset % width as u64
}

/// Bytes from `offset` to the end of its stripe.
pub fn stripe_remaining(offset: u64, width: u32) -> u64 {
    width as u64 - offset_in_stripe(offset, width)
}

pub fn owning_node(
    backend: &dyn Backend,
    vino: VInode,
    stripe: u64,
    layout: &StripeLayout,
) -> Result<u32> {
    Ok(backend.stripe_owner(vino, stripe, layout)?)
}
