#![warn(missing_docs)]
/*! Network codecs for automotive co-simulation.

Simulation components exchange bus traffic as encoded byte streams. This
crate provides the codecs that sit between a model and such a stream: a
CAN frame codec and a PDU codec, both encoding batches of messages into
size-prefixed stream records, plus the bus topology router that copies
those bytes between named simulation variables and codec streams.

# Architecture overview

```text
   [ Model ]
       ↓ write()/read()        CAN frames, PDUs
   [ NCodec ]
       ↓ Stream trait          size-prefixed records
   [ MemoryStream (or host stream) ]
       ↓ rx()/tx()             raw or Ascii85 bytes
   [ BusTopology ]
       ↓                       variable get/set
   [ Co-simulation host ]
```

A codec is opened from a MIMEtype descriptor that selects the codec family
and configures the sender identity:

```text
application/x-automotive-bus; interface=stream; type=frame; bus=can;
    schema=fbs; bus_id=1; node_id=2; interface_id=3
```

Writes batch messages in the codec; `flush` serializes the batch as one
size-prefixed record and appends it to the stream. Reads iterate the
stream's records and their inner message vectors, skipping messages the
codec itself sent (loopback suppression on `node_id` for CAN frames,
`swc_id` for PDUs).

# Example

```
use buscodec::can::CanMessage;
use buscodec::{MemoryStream, SeekOp};

let mime = "application/x-automotive-bus; \
    interface=stream;type=frame;bus=can;schema=fbs;\
    bus_id=1;node_id=2;interface_id=3";
let mut nc = buscodec::open(mime, MemoryStream::new(1024))?;

// Encode a frame and flush it to the stream, spoofing a peer node so the
// loopback filter lets it back through below.
nc.config("node_id", "8")?;
nc.as_can().unwrap().write(&CanMessage {
    frame_id: 42,
    payload: b"Hello World",
    ..Default::default()
})?;
nc.flush()?;
nc.config("node_id", "2")?;

// Rewind and read the frame back.
nc.seek(0, SeekOp::Set)?;
let msg = nc.as_can().unwrap().read()?;
assert_eq!(msg.frame_id, 42);
assert_eq!(msg.payload, b"Hello World");
# Ok::<(), buscodec::Error>(())
```

The returned message payload borrows the codec's parse state: copy it
before the next codec call if it needs to outlive it.
*/

pub mod ascii85;
pub mod can;
pub mod codec;
pub mod fbs;
pub mod pdu;
pub mod stream;
pub mod topology;

pub use codec::{ConfigItem, NCodec, Registry, open};
pub use stream::{MemoryStream, PosOp, SeekOp, Stream};

/// Error kinds reported by codec, stream and router operations.
///
/// Errors are reported, not retried: parse-level anomalies inside a stream
/// cause the offending item to be skipped, and only an exhausted stream
/// reports [`Error::NoMessage`].
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Codec handle invalid or stream unbound.
    #[error("no stream")]
    NoStream,

    /// The codec has no stream resource configured.
    #[error("no stream resource")]
    NoStreamResource,

    /// Null or malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A read exhausted the stream.
    #[error("no message")]
    NoMessage,

    /// A write would overflow a fixed-capacity stream.
    #[error("message exceeds stream capacity")]
    MessageSize,

    /// No codec library loaded in the registry.
    #[error("no codec library loaded")]
    LibAccess,

    /// No registry entry claims the media type.
    #[error("no codec entry for media type")]
    NoEntry,

    /// No codec matches the MIMEtype parameters.
    #[error("no codec matching MIME type")]
    NoData,
}

impl Error {
    /// The conventional negative integer for this error kind, for hosts
    /// that surface errors as C-style return values.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Error::NoStream => -60,
            Error::NoStreamResource => -63,
            Error::InvalidArg(_) => -22,
            Error::NoMessage => -42,
            Error::MessageSize => -90,
            Error::LibAccess => -79,
            Error::NoEntry => -2,
            Error::NoData => -61,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_match_convention() {
        assert_eq!(Error::NoStream.code(), -60);
        assert_eq!(Error::NoStreamResource.code(), -63);
        assert_eq!(Error::InvalidArg("x".into()).code(), -22);
        assert_eq!(Error::NoMessage.code(), -42);
        assert_eq!(Error::MessageSize.code(), -90);
        assert_eq!(Error::LibAccess.code(), -79);
        assert_eq!(Error::NoEntry.code(), -2);
        assert_eq!(Error::NoData.code(), -61);
    }
}
