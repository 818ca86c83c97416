//! LAYOUTGET, LAYOUTRETURN and LAYOUTCOMMIT for files layouts.
//!
//! Only one layout shape is ever granted: a single segment covering the
//! whole stripe pattern, `[0, BIGGEST_PATTERN * stripe_unit)`, with one
//! data-server handle and a device id equal to the inode number. Linux
//! clients ignore layouts that do not cover the file, so a whole-file
//! request is answered with the full pattern even though the file may
//! extend past it.

use tracing::{debug, error, warn};

use super::ds::encode_payload;
use super::xdr::{XdrReader, XdrWriter};
use super::{
    DeviceId, LayoutCommitArgs, LayoutCommitResult, LayoutGetArgs, LayoutGetResult,
    LayoutReturnArgs, LayoutType, Segment, BIGGEST_PATTERN, DEVICE_ID_LEN,
    STRIPE_UNIT_SIZE_MASK,
};
use crate::backend::{AttrUpdate, FileKind, NfsTime, StripeLayout};
use crate::error::{FsalError, Result};
use crate::handle::ObjectHandle;
use crate::recall;

/// Decoded `nfsv4_1_file_layout4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLayoutBody {
    pub device_id: DeviceId,
    pub util: u32,
    pub first_stripe_index: u32,
    pub pattern_offset: u64,
    pub handles: Vec<Vec<u8>>,
}

impl FileLayoutBody {
    pub fn stripe_unit(&self) -> u32 {
        self.util & STRIPE_UNIT_SIZE_MASK
    }
}

pub fn encode_file_layout(
    device_id: &DeviceId,
    util: u32,
    handles: &[&[u8]],
    limit: usize,
) -> Result<Vec<u8>> {
    let mut w = XdrWriter::with_limit(limit);
    w.put_opaque_fixed(&device_id.to_bytes())?;
    w.put_u32(util)?;
    // Sparse layout with commit through the data server: the pattern
    // starts at stripe 0 and has no offset.
    w.put_u32(0)?;
    w.put_u64(0)?;
    w.put_u32(handles.len() as u32)?;
    for fh in handles {
        w.put_opaque(fh)?;
    }
    Ok(w.into_bytes())
}

pub fn decode_file_layout(body: &[u8]) -> Result<FileLayoutBody> {
    let mut r = XdrReader::new(body);
    let device_id = DeviceId::from_bytes(r.get_opaque_fixed(DEVICE_ID_LEN)?)?;
    let util = r.get_u32()?;
    let first_stripe_index = r.get_u32()?;
    let pattern_offset = r.get_u64()?;
    let count = r.get_u32()? as usize;
    let mut handles = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        handles.push(r.get_opaque()?.to_vec());
    }
    Ok(FileLayoutBody {
        device_id,
        util,
        first_stripe_index,
        pattern_offset,
        handles,
    })
}

fn check_stripe_unit(layout: &StripeLayout) -> Result<u32> {
    let width = layout.stripe_unit;
    if width == 0 || width & !STRIPE_UNIT_SIZE_MASK != 0 {
        error!("backend returned stripe width disallowed by NFS: {}", width);
        return Err(FsalError::ServerFault(format!(
            "stripe width {} is not expressible",
            width
        )));
    }
    Ok(width)
}

fn check_type(raw: u32) -> Result<LayoutType> {
    LayoutType::from_wire(raw).map_err(|e| {
        error!("unsupported layout type: {:#x}", raw);
        e
    })
}

impl ObjectHandle {
    /// Grant a layout segment.
    pub fn layoutget(&self, args: &LayoutGetArgs) -> Result<LayoutGetResult> {
        check_type(args.layout_type)?;
        let export = self.export()?;
        let backend = self.backend();
        if !backend.supports_pnfs() {
            return Err(FsalError::LayoutUnavailable);
        }
        if self.kind() != FileKind::Regular {
            return Err(FsalError::NotRegularFile);
        }

        let vino = self.vino();
        let file_layout = backend.file_layout(vino)?;
        let width = check_stripe_unit(&file_layout)?;
        let span = BIGGEST_PATTERN as u64 * width as u64;

        let mode = args.segment.io_mode;
        let smallest = Segment::new(mode, args.segment.offset, args.min_length);
        if !args.segment.is_whole_file() {
            let forbidden = Segment::new(mode, span, u64::MAX);
            if smallest.overlaps(&forbidden) {
                error!(
                    "required layout extends beyond allowed region. offset: {}, minlength: {}",
                    args.segment.offset, args.min_length
                );
                return Err(FsalError::BadLayout {
                    offset: args.segment.offset,
                    min_length: args.min_length,
                });
            }
        }
        let mut granted = Segment::new(mode, 0, span);

        let hook = recall::hook(export.recall.clone(), self.handle_to_key());
        {
            let mut state = self.lock_state();
            if state.pins.pin(&**backend, vino, mode, &hook)? {
                debug!("first {:?} layout on inode {}", mode, vino.ino);
            }
            if mode.is_write() {
                if let Some(bound) = state.pins.write_bound() {
                    let forbidden = Segment::new(mode, bound, u64::MAX);
                    if smallest.overlaps(&forbidden) {
                        state.pins.unpin(&**backend, vino, mode)?;
                        return Err(FsalError::BadLayout {
                            offset: args.segment.offset,
                            min_length: args.min_length,
                        });
                    }
                    granted.length = granted.length.min(bound);
                }
            }
        }

        debug!(
            "will issue layout offset: {} length: {}",
            granted.offset, granted.length
        );

        let device_id = DeviceId {
            export_id: export.id,
            device_serial: self.handle_to_key().inode,
        };
        let body = match self.layout_body(&device_id, &file_layout, width, export.pnfs.loc_body_size)
        {
            Ok(body) => body,
            Err(e) => {
                error!("failed to encode nfsv4_1_file_layout: {}", e);
                let mut state = self.lock_state();
                state.pins.unpin(&**backend, vino, mode)?;
                return Err(e);
            }
        };

        Ok(LayoutGetResult {
            segment: granted,
            device_id,
            body,
            return_on_close: true,
            last_segment: true,
        })
    }

    fn layout_body(
        &self,
        device_id: &DeviceId,
        file_layout: &StripeLayout,
        util: u32,
        limit: usize,
    ) -> Result<Vec<u8>> {
        let snap_seq = self.backend().snap_seq(self.vino())?;
        let payload = encode_payload(&self.handle_to_key(), file_layout, snap_seq);
        encode_file_layout(device_id, util, &[&payload[..]], limit)
    }

    /// Give back a layout segment. Only a disposing return changes state.
    pub fn layoutreturn(&self, args: &LayoutReturnArgs) -> Result<()> {
        check_type(args.layout_type)?;
        if !args.dispose {
            return Ok(());
        }
        let mut state = self.lock_state();
        state
            .pins
            .unpin(&**self.backend(), self.vino(), args.segment.io_mode)
            .map_err(|e| {
                warn!(
                    "{:?} layout return on inode {} with nothing outstanding",
                    args.segment.io_mode,
                    self.vino().ino
                );
                e
            })
    }

    /// Fold size and mtime written through data servers back into the
    /// object's attributes. Never shrinks the file or moves mtime back.
    pub fn layoutcommit(&self, args: &LayoutCommitArgs) -> Result<LayoutCommitResult> {
        check_type(args.layout_type)?;
        let _commit = self.lock_commit();
        let backend = self.backend();

        let current = backend.getattr(self.inode()).map_err(|e| {
            error!("error {} getting attributes of inode {}", e, self.vino().ino);
            e
        })?;

        let mut update = AttrUpdate::default();
        let mut res = LayoutCommitResult::default();
        if let Some(last_write) = args.last_write {
            let needed = last_write.saturating_add(1);
            if needed > current.size {
                update.size = Some(needed);
                res.size_supplied = true;
                res.new_size = needed;
            }
        }
        update.mtime = Some(match args.new_time {
            Some(t) if t > current.mtime => t,
            _ => NfsTime::now().max(current.mtime),
        });

        backend.setattr(self.inode(), &update).map_err(|e| {
            error!("error {} setting attributes of inode {}", e, self.vino().ino);
            e
        })?;

        res.commit_done = true;
        Ok(res)
    }
}
