/*! CAN frame codec (`interface=stream; type=frame; bus=can; schema=fbs`).

Outgoing frames accumulate in a batch that [`CanCodec::flush`] serializes
as one size-prefixed stream message. Incoming stream messages are consumed
through a two-level iterator (outer record, inner frame index) that skips
foreign records, non-CAN items and frames sent by this codec's own node.
*/
use std::fmt;

use log::debug;

use crate::codec::CodecBase;
use crate::fbs::{self, Builder};
use crate::stream::{SeekOp, Stream};
use crate::{Error, Result};

/// File identifier of CAN frame stream records.
const IDENT: &[u8; 4] = b"SFRA";

// Stream table.
const STREAM_FRAMES: u16 = 0;
// Frame wrapper table: a union of frame kinds, CAN being the only member.
const FRAME_F_TYPE: u16 = 0;
const FRAME_F: u16 = 1;
const FRAME_UNION_CAN: u8 = 1;
// CanFrame table.
const CAN_FRAME_ID: u16 = 0;
const CAN_PAYLOAD: u16 = 1;
const CAN_FRAME_TYPE: u16 = 2;
const CAN_BUS_ID: u16 = 3;
const CAN_NODE_ID: u16 = 4;
const CAN_INTERFACE_ID: u16 = 5;

/// CAN frame type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CanFrameType {
    /// Classic frame, 11-bit identifier.
    #[default]
    Base = 0,
    /// Classic frame, 29-bit identifier.
    Extended = 1,
    /// CAN FD frame, 11-bit identifier.
    FdBase = 2,
    /// CAN FD frame, 29-bit identifier.
    FdExtended = 3,
}

impl CanFrameType {
    fn from_wire(v: u8) -> Self {
        match v {
            1 => Self::Extended,
            2 => Self::FdBase,
            3 => Self::FdExtended,
            _ => Self::Base,
        }
    }
}

/// Sender identity carried by each encoded frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanSender {
    /// Bus the frame was sent on.
    pub bus_id: u8,
    /// Sending node; 0 means unidentified.
    pub node_id: u8,
    /// Sending interface on that node.
    pub interface_id: u8,
}

/// Frame timing in nanoseconds. Kept on the in-memory representation only;
/// not part of the wire encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanTiming {
    /// When the frame was handed to the codec.
    pub send: u64,
    /// When the frame won bus arbitration.
    pub arb: u64,
    /// When the frame was received from the codec.
    pub recv: u64,
}

/// One CAN frame.
///
/// On write, the payload is borrowed from the caller and copied during the
/// call; the sender identity is taken from the codec configuration, not
/// from [`CanMessage::sender`]. On read, the payload borrows the codec's
/// parse state: copy it to keep it past the next codec call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanMessage<'a> {
    /// CAN message identifier.
    pub frame_id: u32,
    /// Frame payload, up to 64 bytes for FD frames.
    pub payload: &'a [u8],
    /// Frame type.
    pub frame_type: CanFrameType,
    /// Sender identity, populated on read.
    pub sender: CanSender,
    /// Timing metadata (optional).
    pub timing: CanTiming,
}

/// Observation hooks, called after each successful write or read.
///
/// Hooks never mutate codec state and cannot fail.
#[derive(Default)]
pub struct CanTrace {
    /// Called with each message accepted by `write`.
    pub write: Option<Box<dyn FnMut(&CanMessage<'_>)>>,
    /// Called with each message yielded by `read`.
    pub read: Option<Box<dyn FnMut(&CanMessage<'_>)>>,
}

impl CanTrace {
    /// Hooks that emit one `debug!` line per traced frame.
    #[must_use]
    pub fn log() -> Self {
        Self {
            write: Some(Box::new(|m| {
                debug!("tx frame {:#x} len {}", m.frame_id, m.payload.len());
            })),
            read: Some(Box::new(|m| {
                debug!(
                    "rx frame {:#x} len {} node {}",
                    m.frame_id,
                    m.payload.len(),
                    m.sender.node_id
                );
            })),
        }
    }
}

impl fmt::Debug for CanTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanTrace")
            .field("write", &self.write.is_some())
            .field("read", &self.read.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct FrameItem {
    frame_id: u32,
    payload: Vec<u8>,
    frame_type: CanFrameType,
    bus_id: u8,
    node_id: u8,
    interface_id: u8,
}

/// The CAN frame codec.
#[derive(Debug)]
pub struct CanCodec<S: Stream> {
    pub(crate) base: CodecBase<S>,
    batch: Option<Vec<FrameItem>>,
    trace: CanTrace,
}

impl<S: Stream> CanCodec<S> {
    pub(crate) fn new(mime_type: &str, params: crate::codec::Params) -> Self {
        Self {
            base: CodecBase::new(mime_type, params),
            batch: None,
            trace: CanTrace::default(),
        }
    }

    /// Install observation hooks.
    pub fn set_trace(&mut self, trace: CanTrace) {
        self.trace = trace;
    }

    /// Append one frame to the outgoing batch. The first write after a
    /// `flush` or `truncate` opens a new batch. The stream is not touched.
    ///
    /// Returns the payload length.
    pub fn write(&mut self, msg: &CanMessage<'_>) -> Result<usize> {
        self.base.require_stream()?;
        let p = &self.base.params;
        let item = FrameItem {
            frame_id: msg.frame_id,
            payload: msg.payload.to_vec(),
            frame_type: msg.frame_type,
            bus_id: p.bus_id,
            node_id: p.node_id,
            interface_id: p.interface_id,
        };
        self.batch.get_or_insert_with(Vec::new).push(item);
        if let Some(f) = &mut self.trace.write {
            f(msg);
        }
        Ok(msg.payload.len())
    }

    /// Serialize the batch as one stream message and append it to the
    /// stream. Returns the bytes appended; 0 when no batch was open.
    pub fn flush(&mut self) -> Result<usize> {
        self.base.require_stream()?;
        let Some(items) = self.batch.take() else {
            return Ok(0);
        };
        let record = encode_record(&items);
        self.base.stream_mut()?.write(&record)?;
        Ok(record.len())
    }

    /// Discard the pending batch and any parse state, and reset the stream
    /// so that position and length are both zero.
    pub fn truncate(&mut self) -> Result<()> {
        self.base.require_stream()?;
        self.batch = None;
        self.base.parse.clear();
        self.base.stream_mut()?.seek(0, SeekOp::Reset)?;
        Ok(())
    }

    /// Yield the next frame from the stream.
    ///
    /// Frames whose sender node equals this codec's configured non-zero
    /// `node_id` are skipped. When the current record is exhausted the
    /// iterator advances to the next one; an exhausted stream reports
    /// [`Error::NoMessage`] with the cursor at the stream end.
    ///
    /// The returned payload borrows the codec's parse state and is only
    /// valid until the next codec call.
    pub fn read(&mut self) -> Result<CanMessage<'_>> {
        self.base.require_stream()?;
        let node_id = self.base.params.node_id;
        let found = loop {
            if self.base.parse.body.is_none() {
                self.base.next_record(IDENT)?;
            }
            let start = self.base.parse.idx;
            let scan = self
                .base
                .parse
                .body
                .as_deref()
                .and_then(|body| scan_frames(body, start, node_id));
            match scan {
                Some(i) => break i,
                None => self.base.parse.clear(),
            }
        };
        self.base.parse.idx = found + 1;
        let body = self.base.parse.body.as_deref().unwrap_or_default();
        let msg = decode_frame(body, found).ok_or(Error::NoMessage)?;
        if let Some(f) = &mut self.trace.read {
            f(&msg);
        }
        Ok(msg)
    }
}

fn encode_record(items: &[FrameItem]) -> Vec<u8> {
    let mut b = Builder::new(IDENT);
    let mut stream_t = b.start_table();
    let frames_slot = b.field_ref(&mut stream_t, STREAM_FRAMES);
    let root = b.end_table(stream_t);
    let (vec_pos, slots) = b.ref_vector(items.len());
    b.patch(frames_slot, vec_pos);
    for (item, slot) in items.iter().zip(slots) {
        let mut frame_t = b.start_table();
        b.field_u8(&mut frame_t, FRAME_F_TYPE, FRAME_UNION_CAN, 0);
        let f_slot = b.field_ref(&mut frame_t, FRAME_F);
        let frame_pos = b.end_table(frame_t);
        b.patch(slot, frame_pos);

        let mut can_t = b.start_table();
        b.field_u32(&mut can_t, CAN_FRAME_ID, item.frame_id, 0);
        let payload_slot = b.field_ref(&mut can_t, CAN_PAYLOAD);
        b.field_u8(&mut can_t, CAN_FRAME_TYPE, item.frame_type as u8, 0);
        b.field_u8(&mut can_t, CAN_BUS_ID, item.bus_id, 0);
        b.field_u8(&mut can_t, CAN_NODE_ID, item.node_id, 0);
        b.field_u8(&mut can_t, CAN_INTERFACE_ID, item.interface_id, 0);
        let can_pos = b.end_table(can_t);
        b.patch(f_slot, can_pos);

        let payload_pos = b.byte_vector(&item.payload);
        b.patch(payload_slot, payload_pos);
    }
    b.finish(root)
}

/// Find the next surviving frame at or after `start`. Items with an absent
/// or non-CAN union tag, and loopback frames, are skipped.
fn scan_frames(body: &[u8], start: usize, node_id: u8) -> Option<usize> {
    let root = fbs::root_table(body, IDENT)?;
    let frames = root.get_vector(STREAM_FRAMES)?;
    for i in start..frames.len() {
        let Some(frame) = frames.table(i) else {
            continue;
        };
        if frame.get_u8(FRAME_F_TYPE, 0) != FRAME_UNION_CAN {
            continue;
        }
        let Some(can) = frame.get_table(FRAME_F) else {
            continue;
        };
        if node_id != 0 && can.get_u8(CAN_NODE_ID, 0) == node_id {
            continue;
        }
        return Some(i);
    }
    None
}

fn decode_frame(body: &[u8], i: usize) -> Option<CanMessage<'_>> {
    let root = fbs::root_table(body, IDENT)?;
    let can = root.get_vector(STREAM_FRAMES)?.table(i)?.get_table(FRAME_F)?;
    Some(CanMessage {
        frame_id: can.get_u32(CAN_FRAME_ID, 0),
        payload: can.get_bytes(CAN_PAYLOAD).unwrap_or_default(),
        frame_type: CanFrameType::from_wire(can.get_u8(CAN_FRAME_TYPE, 0)),
        sender: CanSender {
            bus_id: can.get_u8(CAN_BUS_ID, 0),
            node_id: can.get_u8(CAN_NODE_ID, 0),
            interface_id: can.get_u8(CAN_INTERFACE_ID, 0),
        },
        timing: CanTiming::default(),
    })
}
