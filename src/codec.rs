/*! Codec selection, configuration and the registry.

A codec instance is created from a MIMEtype descriptor such as

```text
application/x-automotive-bus; interface=stream; type=frame; bus=can;
    schema=fbs; bus_id=1; node_id=2; interface_id=3
```

The media type selects the implementation bank; within the bank the
`interface`/`type`/`schema` triple (plus `bus` for the frame family)
selects the concrete codec. The remaining parameters configure the codec's
sender identity and can be overridden later through [`NCodec::config`].

Codecs are a closed sum: [`NCodec`] is either a CAN frame codec or a PDU
codec. Hosts that expect to load further codec banks hold a [`Registry`]
mapping media types to factories.
*/
use log::debug;

use crate::can::CanCodec;
use crate::pdu::PduCodec;
use crate::stream::{SeekOp, Stream};
use crate::{Error, Result};

/// Media type of the automotive bus codec bank.
pub const MEDIA_TYPE: &str = "application/x-automotive-bus";

/// One named configuration item, as reported by [`NCodec::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigItem<'a> {
    /// Item name, e.g. `node_id`.
    pub name: &'static str,
    /// Item value; `None` when the item was never configured.
    pub value: Option<&'a str>,
}

const ITEM_NAMES: [&str; 9] = [
    "interface",
    "type",
    "bus",
    "schema",
    "bus_id",
    "node_id",
    "interface_id",
    "swc_id",
    "ecu_id",
];

/// The configuration parameter set shared by both codec families.
///
/// Integer-valued selectors are kept in both string form (for `stat`) and
/// parsed form (for encoding and filtering); a value that does not parse
/// as base-10 reads as 0.
#[derive(Debug, Default, Clone)]
pub(crate) struct Params {
    pub interface: Option<String>,
    pub kind: Option<String>,
    pub bus: Option<String>,
    pub schema: Option<String>,
    bus_id_str: Option<String>,
    node_id_str: Option<String>,
    interface_id_str: Option<String>,
    swc_id_str: Option<String>,
    ecu_id_str: Option<String>,
    pub bus_id: u8,
    pub node_id: u8,
    pub interface_id: u8,
    pub swc_id: u32,
    pub ecu_id: u32,
}

impl Params {
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "interface" => self.interface = Some(value.to_owned()),
            "type" => self.kind = Some(value.to_owned()),
            "bus" => self.bus = Some(value.to_owned()),
            "schema" => self.schema = Some(value.to_owned()),
            "bus_id" => {
                self.bus_id = value.parse().unwrap_or(0);
                self.bus_id_str = Some(value.to_owned());
            }
            "node_id" => {
                self.node_id = value.parse().unwrap_or(0);
                self.node_id_str = Some(value.to_owned());
            }
            "interface_id" => {
                self.interface_id = value.parse().unwrap_or(0);
                self.interface_id_str = Some(value.to_owned());
            }
            "swc_id" => {
                self.swc_id = value.parse().unwrap_or(0);
                self.swc_id_str = Some(value.to_owned());
            }
            "ecu_id" => {
                self.ecu_id = value.parse().unwrap_or(0);
                self.ecu_id_str = Some(value.to_owned());
            }
            _ => {
                return Err(Error::InvalidArg(format!("unknown config item: {name}")));
            }
        }
        Ok(())
    }

    pub fn item(&self, index: usize) -> Option<ConfigItem<'_>> {
        let value = match index {
            0 => self.interface.as_deref(),
            1 => self.kind.as_deref(),
            2 => self.bus.as_deref(),
            3 => self.schema.as_deref(),
            4 => self.bus_id_str.as_deref(),
            5 => self.node_id_str.as_deref(),
            6 => self.interface_id_str.as_deref(),
            7 => self.swc_id_str.as_deref(),
            8 => self.ecu_id_str.as_deref(),
            _ => return None,
        };
        Some(ConfigItem {
            name: ITEM_NAMES[index],
            value,
        })
    }
}

/// Parse a MIMEtype descriptor: media type, then `;`-separated `k=v`
/// pairs with arbitrary surrounding whitespace. Unknown keys are accepted
/// and ignored.
fn parse_mime(mime_type: &str) -> Result<Params> {
    let mut parts = mime_type.split(';');
    let media = parts.next().unwrap_or("").trim();
    if !media.starts_with(MEDIA_TYPE) {
        return Err(Error::NoData);
    }
    let mut params = Params::default();
    for part in parts {
        if let Some((name, value)) = part.split_once('=') {
            let _ = params.set(name.trim(), value.trim());
        }
    }
    Ok(params)
}

enum Selected {
    Can,
    Pdu,
}

fn select(params: &Params) -> Result<Selected> {
    if params.interface.as_deref() != Some("stream") || params.schema.as_deref() != Some("fbs") {
        return Err(Error::NoData);
    }
    match params.kind.as_deref() {
        Some("frame") => match params.bus.as_deref() {
            Some("can") => Ok(Selected::Can),
            _ => Err(Error::NoData),
        },
        Some("pdu") => Ok(Selected::Pdu),
        _ => Err(Error::NoData),
    }
}

/// State shared by both codec families: configuration, the stream binding
/// and the incoming-record parse state.
#[derive(Debug)]
pub(crate) struct CodecBase<S> {
    pub mime_type: String,
    pub params: Params,
    pub stream: Option<S>,
    pub parse: ParseState,
}

/// Two-level read iterator state: the current outer record body plus the
/// next inner index.
#[derive(Debug, Default)]
pub(crate) struct ParseState {
    pub body: Option<Vec<u8>>,
    pub idx: usize,
}

impl ParseState {
    pub fn set(&mut self, body: Vec<u8>) {
        self.body = Some(body);
        self.idx = 0;
    }

    pub fn clear(&mut self) {
        self.body = None;
        self.idx = 0;
    }
}

impl<S: Stream> CodecBase<S> {
    pub fn new(mime_type: &str, params: Params) -> Self {
        Self {
            mime_type: mime_type.to_owned(),
            params,
            stream: None,
            parse: ParseState::default(),
        }
    }

    /// The stream, for operations that require one (`write`/`read`/...).
    pub fn stream_mut(&mut self) -> Result<&mut S> {
        self.stream.as_mut().ok_or(Error::NoStreamResource)
    }

    pub fn require_stream(&self) -> Result<()> {
        if self.stream.is_some() {
            Ok(())
        } else {
            Err(Error::NoStreamResource)
        }
    }

    pub fn seek(&mut self, pos: u64, op: SeekOp) -> Result<u64> {
        self.stream.as_mut().ok_or(Error::NoStream)?.seek(pos, op)
    }

    pub fn tell(&self) -> Result<u64> {
        Ok(self.stream.as_ref().ok_or(Error::NoStream)?.tell())
    }

    pub fn eof(&self) -> Result<bool> {
        Ok(self.stream.as_ref().ok_or(Error::NoStream)?.eof())
    }

    /// Pull the next outer record into the parse state, or report
    /// [`Error::NoMessage`] with the cursor parked at the stream end.
    pub fn next_record(&mut self, ident: &[u8; 4]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NoStreamResource)?;
        match crate::fbs::find_next_record(stream, ident)? {
            Some(body) => {
                self.parse.set(body);
                Ok(())
            }
            None => {
                self.parse.clear();
                Err(Error::NoMessage)
            }
        }
    }
}

/// A network codec instance: the closed sum of the two codec families.
#[derive(Debug)]
pub enum NCodec<S: Stream> {
    /// CAN frame codec (`type=frame; bus=can`).
    Can(CanCodec<S>),
    /// PDU codec (`type=pdu`).
    Pdu(PduCodec<S>),
}

impl<S: Stream> NCodec<S> {
    /// Create a codec from a MIMEtype descriptor, without a stream.
    ///
    /// Message operations fail with [`Error::NoStreamResource`] until a
    /// stream is bound with [`NCodec::bind`].
    pub fn create(mime_type: &str) -> Result<Self> {
        let params = parse_mime(mime_type)?;
        let nc = match select(&params)? {
            Selected::Can => Self::Can(CanCodec::new(mime_type, params)),
            Selected::Pdu => Self::Pdu(PduCodec::new(mime_type, params)),
        };
        debug!("created codec for {mime_type}");
        Ok(nc)
    }

    /// Create a codec and bind it to `stream`.
    pub fn open(mime_type: &str, stream: S) -> Result<Self> {
        let mut nc = Self::create(mime_type)?;
        nc.bind(stream);
        Ok(nc)
    }

    /// Bind the codec to a stream, replacing any previous binding.
    pub fn bind(&mut self, stream: S) {
        self.base_mut().stream = Some(stream);
    }

    fn base(&self) -> &CodecBase<S> {
        match self {
            Self::Can(c) => &c.base,
            Self::Pdu(c) => &c.base,
        }
    }

    fn base_mut(&mut self) -> &mut CodecBase<S> {
        match self {
            Self::Can(c) => &mut c.base,
            Self::Pdu(c) => &mut c.base,
        }
    }

    /// The MIMEtype this codec was created from.
    #[must_use]
    pub fn mime_type(&self) -> &str {
        &self.base().mime_type
    }

    /// Set a configuration item, overriding any MIMEtype value.
    pub fn config(&mut self, name: &str, value: &str) -> Result<()> {
        self.base_mut().params.set(name, value)
    }

    /// Report the configuration item at `index`, `None` past the last one.
    #[must_use]
    pub fn stat(&self, index: usize) -> Option<ConfigItem<'_>> {
        self.base().params.item(index)
    }

    /// Iterate all configuration items.
    pub fn config_items(&self) -> impl Iterator<Item = ConfigItem<'_>> {
        (0..ITEM_NAMES.len()).filter_map(|i| self.stat(i))
    }

    /// Serialize the accumulated batch as one stream message and append it
    /// to the stream. Returns the bytes appended; 0 when nothing was
    /// buffered.
    pub fn flush(&mut self) -> Result<usize> {
        match self {
            Self::Can(c) => c.flush(),
            Self::Pdu(c) => c.flush(),
        }
    }

    /// Discard the pending batch and reset the stream to empty.
    pub fn truncate(&mut self) -> Result<()> {
        match self {
            Self::Can(c) => c.truncate(),
            Self::Pdu(c) => c.truncate(),
        }
    }

    /// Seek on the bound stream.
    pub fn seek(&mut self, pos: u64, op: SeekOp) -> Result<u64> {
        self.base_mut().seek(pos, op)
    }

    /// Position of the bound stream.
    pub fn tell(&self) -> Result<u64> {
        self.base().tell()
    }

    /// EOF indicator of the bound stream.
    pub fn eof(&self) -> Result<bool> {
        self.base().eof()
    }

    /// The bound stream, if any.
    #[must_use]
    pub fn stream(&self) -> Option<&S> {
        self.base().stream.as_ref()
    }

    /// Mutable access to the bound stream, if any.
    pub fn stream_mut(&mut self) -> Option<&mut S> {
        self.base_mut().stream.as_mut()
    }

    /// The CAN codec, when this instance is one.
    pub fn as_can(&mut self) -> Option<&mut CanCodec<S>> {
        match self {
            Self::Can(c) => Some(c),
            Self::Pdu(_) => None,
        }
    }

    /// The PDU codec, when this instance is one.
    pub fn as_pdu(&mut self) -> Option<&mut PduCodec<S>> {
        match self {
            Self::Can(_) => None,
            Self::Pdu(c) => Some(c),
        }
    }

    /// Release the codec, handing the stream back to its owner.
    pub fn close(self) -> Option<S> {
        let base = match self {
            Self::Can(c) => c.base,
            Self::Pdu(c) => c.base,
        };
        base.stream
    }
}

/// A codec factory: creates an unbound codec from a MIMEtype.
pub type Factory<S> = fn(mime_type: &str) -> Result<NCodec<S>>;

/// Maps media-type prefixes to codec factories.
///
/// Hosts hold one registry value; there is no global state. The default
/// registry carries the automotive bus bank.
pub struct Registry<S: Stream> {
    entries: Vec<(&'static str, Factory<S>)>,
}

impl<S: Stream> Registry<S> {
    /// A registry with no codec banks loaded.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// The default registry: the automotive bus bank only.
    #[must_use]
    pub fn new() -> Self {
        let mut r = Self::empty();
        r.register(MEDIA_TYPE, NCodec::create);
        r
    }

    /// Register a codec bank for a media-type prefix.
    pub fn register(&mut self, media_type: &'static str, factory: Factory<S>) {
        self.entries.push((media_type, factory));
    }

    /// Create an unbound codec for the MIMEtype.
    ///
    /// Fails with [`Error::LibAccess`] when the registry is empty,
    /// [`Error::NoEntry`] when no bank claims the media type, and
    /// [`Error::NoData`] when the bank rejects the parameters.
    pub fn create(&self, mime_type: &str) -> Result<NCodec<S>> {
        if self.entries.is_empty() {
            return Err(Error::LibAccess);
        }
        let media = mime_type.split(';').next().unwrap_or("").trim();
        let entry = self
            .entries
            .iter()
            .find(|(m, _)| media.starts_with(m))
            .ok_or(Error::NoEntry)?;
        (entry.1)(mime_type)
    }

    /// Create a codec for the MIMEtype and bind it to `stream`.
    pub fn open(&self, mime_type: &str, stream: S) -> Result<NCodec<S>> {
        let mut nc = self.create(mime_type)?;
        nc.bind(stream);
        Ok(nc)
    }
}

impl<S: Stream> Default for Registry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Open a codec against the default registry.
pub fn open<S: Stream>(mime_type: &str, stream: S) -> Result<NCodec<S>> {
    Registry::new().open(mime_type, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    const CAN_MIME: &str = "application/x-automotive-bus; \
        interface=stream;type=frame;bus=can;schema=fbs;\
        bus_id=1;node_id=2;interface_id=3";

    #[test]
    fn config_stores_string_and_integer_forms() -> Result<()> {
        let mut params = Params::default();
        params.set("interface", "IF")?;
        params.set("type", "TY")?;
        params.set("bus", "BU")?;
        params.set("schema", "SC")?;
        params.set("bus_id", "1")?;
        params.set("node_id", "2")?;
        params.set("interface_id", "3")?;
        assert_eq!(params.bus_id, 1);
        assert_eq!(params.node_id, 2);
        assert_eq!(params.interface_id, 3);

        // Later values override.
        params.set("node_id", "5")?;
        assert_eq!(params.node_id, 5);
        assert_eq!(params.item(5).unwrap().value, Some("5"));

        // Garbage integers parse to 0, the string form is kept.
        params.set("bus_id", "seven")?;
        assert_eq!(params.bus_id, 0);
        assert_eq!(params.item(4).unwrap().value, Some("seven"));

        assert!(params.set("unknown", "x").is_err());
        Ok(())
    }

    #[test]
    fn stat_iterates_in_order_then_ends() -> Result<()> {
        let nc = NCodec::<MemoryStream>::create(CAN_MIME)?;
        let expect = [
            ("interface", Some("stream")),
            ("type", Some("frame")),
            ("bus", Some("can")),
            ("schema", Some("fbs")),
            ("bus_id", Some("1")),
            ("node_id", Some("2")),
            ("interface_id", Some("3")),
            ("swc_id", None),
            ("ecu_id", None),
        ];
        for (i, (name, value)) in expect.iter().enumerate() {
            let item = nc.stat(i).unwrap();
            assert_eq!(item.name, *name);
            assert_eq!(item.value, *value);
        }
        assert!(nc.stat(expect.len()).is_none());
        Ok(())
    }

    #[test]
    fn create_selects_codec_family() -> Result<()> {
        let nc = NCodec::<MemoryStream>::create(CAN_MIME)?;
        assert!(matches!(nc, NCodec::Can(_)));
        assert_eq!(nc.mime_type(), CAN_MIME);

        let nc = NCodec::<MemoryStream>::create(
            "application/x-automotive-bus; interface=stream;type=pdu;schema=fbs;swc_id=4;ecu_id=5",
        )?;
        assert!(matches!(nc, NCodec::Pdu(_)));
        Ok(())
    }

    #[test]
    fn create_rejects_bad_mime() {
        let cases = [
            "application/bus",
            "application/x-automotive-bus; interface=stream;type=frame;bus=can;schema=FOO",
            "application/x-automotive-bus; interface=stream;type=frame;bus=FOO;schema=fbs",
            "application/x-automotive-bus; interface=stream;type=FOO;bus=can;schema=fbs",
            "application/x-automotive-bus; interface=FOO;type=frame;bus=can;schema=fbs",
            "application/x-automotive-bus; interface=stream;type=frame;bus=can",
            "application/x-automotive-bus; interface=stream;type=frame;schema=fbs",
            "application/x-automotive-bus; interface=stream;bus=can;schema=fbs",
            "application/x-automotive-bus; type=frame;bus=can;schema=fbs",
            "application/x-automotive-bus; interface=stream",
            "application/x-automotive-bus; schema=fbs",
        ];
        for mime in cases {
            let r = NCodec::<MemoryStream>::create(mime);
            assert!(matches!(r, Err(Error::NoData)), "accepted: {mime}");
        }
    }

    #[test]
    fn mime_whitespace_is_trimmed() -> Result<()> {
        let nc = NCodec::<MemoryStream>::create(
            "application/x-automotive-bus; interface = stream ; type = frame ; \
             bus = can ; schema = fbs ; node_id = 7",
        )?;
        assert_eq!(nc.stat(5).unwrap().value, Some("7"));
        Ok(())
    }

    #[test]
    fn unknown_mime_keys_are_ignored() -> Result<()> {
        let nc = NCodec::<MemoryStream>::create(
            "application/x-automotive-bus; interface=stream;type=frame;bus=can;\
             schema=fbs;future_knob=on",
        )?;
        assert!(matches!(nc, NCodec::Can(_)));
        Ok(())
    }

    #[test]
    fn unbound_codec_reports_stream_errors() -> Result<()> {
        let mut nc = NCodec::<MemoryStream>::create(CAN_MIME)?;
        assert!(matches!(nc.tell(), Err(Error::NoStream)));
        assert!(matches!(nc.seek(0, SeekOp::Set), Err(Error::NoStream)));
        assert!(matches!(nc.flush(), Err(Error::NoStreamResource)));
        assert!(matches!(nc.truncate(), Err(Error::NoStreamResource)));
        Ok(())
    }

    #[test]
    fn registry_error_kinds() {
        let empty = Registry::<MemoryStream>::empty();
        assert!(matches!(empty.create(CAN_MIME), Err(Error::LibAccess)));

        let registry = Registry::<MemoryStream>::new();
        assert!(matches!(
            registry.create("application/unknown; a=b"),
            Err(Error::NoEntry)
        ));
        assert!(matches!(
            registry.create("application/x-automotive-bus; interface=stream"),
            Err(Error::NoData)
        ));
        assert!(registry.create(CAN_MIME).is_ok());
    }

    #[test]
    fn open_binds_stream() -> Result<()> {
        let nc = open(CAN_MIME, MemoryStream::new(256))?;
        assert_eq!(nc.tell()?, 0);
        let stream = nc.close();
        assert!(stream.is_some());
        Ok(())
    }
}
