/*! Bus topology: routing bytes between simulation variables and codecs.

A co-simulation host exchanges network traffic through named variables. The
[`BusTopology`] binds those variables to codec streams using annotations
from the model description document: variables annotated with a `bus_id`
are indexed by causality (inputs receive, outputs transmit), and variables
annotated with a binary-to-text encoding get an Ascii85 transform wired
into the copy path.

One step cycle looks like: `reset` (once), then `rx` for each input
variable, codec reads/writes by the model, `flush`, then `tx` for each
output variable.
*/
use std::collections::HashMap;
use std::path::Path;

use log::debug;

use crate::ascii85;
use crate::codec::NCodec;
use crate::stream::{PosOp, SeekOp, Stream};
use crate::{Error, Result};

const TOPOLOGY_TOOL: &str = "dse.standards.fmi-ls-bus-topology";
const BINARY_TO_TEXT_TOOL: &str = "dse.standards.fmi-ls-binary-to-text";

/// Binary-to-text encoder applied to outgoing variable data.
pub type EncodeFn = fn(&[u8]) -> Vec<u8>;
/// Text-to-binary decoder applied to incoming variable data.
pub type DecodeFn = fn(&[u8]) -> Result<Vec<u8>>;

fn ascii85_encode(data: &[u8]) -> Vec<u8> {
    ascii85::encode(data).into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Causality {
    Input,
    Output,
    Other,
}

#[derive(Debug, Clone)]
struct ScalarVariable {
    name: String,
    value_reference: String,
    causality: Causality,
    bus_id: Option<String>,
    encoding: Option<String>,
}

/// The bus topology router. Owns its codecs; the host reaches a codec
/// through [`BusTopology::codec_mut`] to write and read messages.
pub struct BusTopology<S: Stream> {
    variables: Vec<ScalarVariable>,
    codecs: Vec<NCodec<S>>,
    bus_index: HashMap<String, usize>,
    rx_index: HashMap<String, usize>,
    tx_index: HashMap<String, usize>,
    encode_fns: HashMap<String, EncodeFn>,
    decode_fns: HashMap<String, DecodeFn>,
    tx_buffers: Vec<Vec<u8>>,
    reset_done: bool,
}

impl<S: Stream> BusTopology<S> {
    /// Create a topology from a model description file.
    pub fn create<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let xml = std::fs::read_to_string(model_path)
            .map_err(|e| Error::InvalidArg(format!("model description: {e}")))?;
        Self::from_xml(&xml)
    }

    /// Create a topology from model description content.
    pub fn from_xml(xml: &str) -> Result<Self> {
        Ok(Self {
            variables: parse_model_description(xml)?,
            codecs: Vec::new(),
            bus_index: HashMap::new(),
            rx_index: HashMap::new(),
            tx_index: HashMap::new(),
            encode_fns: HashMap::new(),
            decode_fns: HashMap::new(),
            tx_buffers: Vec::new(),
            reset_done: false,
        })
    }

    /// Register a codec for `bus_id` and index the variables bound to it.
    ///
    /// Inputs annotated with the bus land in the receive index, outputs in
    /// the transmit index. Independently, variables annotated with
    /// `encoding = ascii85` get the matching transform wired in (inputs a
    /// decoder, outputs an encoder).
    pub fn add(&mut self, bus_id: &str, codec: NCodec<S>) {
        let idx = self.codecs.len();
        self.codecs.push(codec);
        self.bus_index.insert(bus_id.to_owned(), idx);
        for v in &self.variables {
            if v.bus_id.as_deref() == Some(bus_id) {
                match v.causality {
                    Causality::Input => {
                        debug!("bus {bus_id}: rx variable {} (vr {})", v.name, v.value_reference);
                        self.rx_index.insert(v.value_reference.clone(), idx);
                    }
                    Causality::Output => {
                        debug!("bus {bus_id}: tx variable {} (vr {})", v.name, v.value_reference);
                        self.tx_index.insert(v.value_reference.clone(), idx);
                    }
                    Causality::Other => {}
                }
            }
            if v.encoding.as_deref() == Some("ascii85") {
                match v.causality {
                    Causality::Input => {
                        self.decode_fns.insert(v.value_reference.clone(), ascii85::decode);
                    }
                    Causality::Output => {
                        self.encode_fns.insert(v.value_reference.clone(), ascii85_encode);
                    }
                    Causality::Other => {}
                }
            }
        }
    }

    /// The codec registered for `bus_id`.
    #[must_use]
    pub fn codec(&self, bus_id: &str) -> Option<&NCodec<S>> {
        self.bus_index.get(bus_id).map(|&i| &self.codecs[i])
    }

    /// Mutable access to the codec registered for `bus_id`.
    pub fn codec_mut(&mut self, bus_id: &str) -> Option<&mut NCodec<S>> {
        self.bus_index.get(bus_id).map(|&i| &mut self.codecs[i])
    }

    /// Receive: append variable data to the indexed codec's stream.
    ///
    /// Unknown variable references are ignored. When a decoder is wired
    /// for the variable the data is decoded during the copy. Afterwards
    /// the stream cursor rests at the start, ready for codec reads.
    pub fn rx(&mut self, vr: &str, data: &[u8]) -> Result<()> {
        let Some(&idx) = self.rx_index.get(vr) else {
            return Ok(());
        };
        let decoded;
        let bytes = match self.decode_fns.get(vr) {
            Some(df) => {
                decoded = df(data)?;
                &decoded
            }
            None => data,
        };
        let Some(stream) = self.codecs[idx].stream_mut() else {
            return Ok(());
        };
        stream.seek(0, SeekOp::End)?;
        stream.write(bytes)?;
        stream.seek(0, SeekOp::Set)?;
        Ok(())
    }

    /// Transmit: snapshot the indexed codec's stream into variable data.
    ///
    /// Unknown variable references yield `None`. When an encoder is wired
    /// for the variable the snapshot is encoded. The returned buffer stays
    /// valid until the next [`BusTopology::reset`].
    pub fn tx(&mut self, vr: &str) -> Result<Option<&[u8]>> {
        self.reset_done = false;
        let Some(&idx) = self.tx_index.get(vr) else {
            return Ok(None);
        };
        let Some(stream) = self.codecs[idx].stream_mut() else {
            return Ok(None);
        };
        stream.seek(0, SeekOp::Set)?;
        let data = stream.read(PosOp::Update)?.to_vec();
        let out = match self.encode_fns.get(vr) {
            Some(ef) => ef(&data),
            None => data,
        };
        self.tx_buffers.push(out);
        Ok(self.tx_buffers.last().map(Vec::as_slice))
    }

    /// Truncate every codec and release the transmit buffers.
    ///
    /// Called at the start of each receive cycle; runs at most once
    /// between transmit batches, so repeated calls are no-ops until the
    /// next [`BusTopology::tx`].
    pub fn reset(&mut self) {
        if self.reset_done {
            return;
        }
        for codec in &mut self.codecs {
            if let Err(e) = codec.truncate() {
                debug!("reset: truncate failed: {e}");
            }
        }
        self.tx_buffers.clear();
        self.reset_done = true;
    }
}

fn parse_model_description(xml: &str) -> Result<Vec<ScalarVariable>> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::InvalidArg(format!("model description: {e}")))?;
    let mut vars = Vec::new();
    for node in doc.descendants().filter(|n| n.has_tag_name("ScalarVariable")) {
        let (Some(name), Some(vr), Some(causality)) = (
            node.attribute("name"),
            node.attribute("valueReference"),
            node.attribute("causality"),
        ) else {
            continue;
        };
        vars.push(ScalarVariable {
            name: name.to_owned(),
            value_reference: vr.to_owned(),
            causality: match causality {
                "input" => Causality::Input,
                "output" => Causality::Output,
                _ => Causality::Other,
            },
            bus_id: tool_annotation(node, TOPOLOGY_TOOL, "bus_id"),
            encoding: tool_annotation(node, BINARY_TO_TEXT_TOOL, "encoding"),
        });
    }
    Ok(vars)
}

/// Look up a tool annotation `<Tool name=tool><Annotation name=name>` under
/// a ScalarVariable node.
fn tool_annotation(node: roxmltree::Node<'_, '_>, tool: &str, name: &str) -> Option<String> {
    let annotations = node.children().find(|n| n.has_tag_name("Annotations"))?;
    for tool_node in annotations
        .children()
        .filter(|n| n.has_tag_name("Tool") && n.attribute("name") == Some(tool))
    {
        for anno in tool_node.children().filter(|n| n.has_tag_name("Annotation")) {
            if anno.attribute("name") == Some(name) {
                return Some(anno.text().unwrap_or_default().trim().to_owned());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::can::CanMessage;
    use crate::stream::MemoryStream;
    use std::io::Write as _;

    const MIME: &str = "application/x-automotive-bus; \
        interface=stream;type=frame;bus=can;schema=fbs;\
        bus_id=1;node_id=2;interface_id=3";

    fn variable(name: &str, vr: u32, causality: &str, bus_id: Option<&str>) -> String {
        let annotations = match bus_id {
            Some(id) => format!(
                r#"
      <Annotations>
        <Tool name="dse.standards.fmi-ls-bus-topology">
          <Annotation name="bus_id">{id}</Annotation>
        </Tool>
        <Tool name="dse.standards.fmi-ls-binary-to-text">
          <Annotation name="encoding">ascii85</Annotation>
        </Tool>
      </Annotations>"#
            ),
            None => String::new(),
        };
        format!(
            r#"    <ScalarVariable name="{name}" valueReference="{vr}" causality="{causality}">
      <String/>{annotations}
    </ScalarVariable>
"#
        )
    }

    fn model_xml() -> String {
        let mut vars = String::new();
        vars.push_str(&variable("reset", 1, "input", None));
        for (i, vr) in [2u32, 4, 6].iter().enumerate() {
            vars.push_str(&variable(&format!("can_rx_{i}"), *vr, "input", Some("1")));
        }
        for (i, vr) in [3u32, 5, 7].iter().enumerate() {
            vars.push_str(&variable(&format!("can_tx_{i}"), *vr, "output", Some("1")));
        }
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<fmiModelDescription fmiVersion="2.0" modelName="network">
  <ModelVariables>
{vars}  </ModelVariables>
</fmiModelDescription>
"#
        )
    }

    fn topology_with_codec() -> BusTopology<MemoryStream> {
        let mut bt = BusTopology::from_xml(&model_xml()).unwrap();
        let nc = NCodec::open(MIME, MemoryStream::new(512)).unwrap();
        bt.add("1", nc);
        bt
    }

    #[test]
    fn create_parses_variables() -> Result<()> {
        let bt = BusTopology::<MemoryStream>::from_xml(&model_xml())?;
        assert_eq!(bt.variables.len(), 7);
        assert!(bt.codecs.is_empty());
        assert!(bt.rx_index.is_empty() && bt.tx_index.is_empty());
        Ok(())
    }

    #[test]
    fn create_from_file() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(model_xml().as_bytes()).expect("write xml");
        let bt = BusTopology::<MemoryStream>::create(file.path())?;
        assert_eq!(bt.variables.len(), 7);
        Ok(())
    }

    #[test]
    fn create_rejects_bad_xml() {
        assert!(BusTopology::<MemoryStream>::from_xml("<broken").is_err());
    }

    #[test]
    fn add_indexes_by_bus_and_causality() {
        let bt = topology_with_codec();
        assert_eq!(bt.bus_index.len(), 1);
        assert_eq!(bt.rx_index.len(), 3);
        assert_eq!(bt.tx_index.len(), 3);
        for vr in ["2", "4", "6"] {
            assert_eq!(bt.rx_index.get(vr), Some(&0), "rx {vr}");
            assert!(bt.decode_fns.contains_key(vr), "decode {vr}");
        }
        for vr in ["3", "5", "7"] {
            assert_eq!(bt.tx_index.get(vr), Some(&0), "tx {vr}");
            assert!(bt.encode_fns.contains_key(vr), "encode {vr}");
        }
        // The unannotated variable is indexed nowhere.
        assert!(!bt.rx_index.contains_key("1"));
    }

    #[test]
    fn rx_unknown_vr_is_silent() -> Result<()> {
        let mut bt = topology_with_codec();
        bt.rx("999", b"BOu!rDZ")?;
        assert!(bt.codec("1").unwrap().stream().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn rx_decodes_into_stream() -> Result<()> {
        let mut bt = topology_with_codec();
        bt.rx("2", b"BOu!rDZ")?;
        let codec = bt.codec("1").unwrap();
        let stream = codec.stream().unwrap();
        assert_eq!(stream.buffer(), b"hello");
        // Cursor at the start, ready for codec reads.
        assert_eq!(codec.tell()?, 0);
        Ok(())
    }

    #[test]
    fn rx_rejects_bad_text() {
        let mut bt = topology_with_codec();
        assert!(bt.rx("2", b"not ascii85 \x07").is_err());
    }

    #[test]
    fn tx_snapshots_and_encodes() -> Result<()> {
        let mut bt = topology_with_codec();
        {
            let stream = bt.codec_mut("1").unwrap().stream_mut().unwrap();
            stream.write(b"hello")?;
        }
        let out = bt.tx("3")?.expect("tx data").to_vec();
        assert_eq!(out, b"BOu!rDZ");
        // The snapshot consumed the stream.
        let codec = bt.codec("1").unwrap();
        assert!(codec.eof()?);
        assert!(bt.tx("999")?.is_none());
        Ok(())
    }

    #[test]
    fn reset_runs_once_per_tx_batch() -> Result<()> {
        let mut bt = topology_with_codec();
        {
            let stream = bt.codec_mut("1").unwrap().stream_mut().unwrap();
            stream.write(b"hello")?;
        }
        let _ = bt.tx("3")?;
        assert!(!bt.tx_buffers.is_empty());

        bt.reset();
        assert!(bt.tx_buffers.is_empty());
        assert_eq!(bt.codec("1").unwrap().stream().unwrap().len(), 0);

        // Without an intervening tx, reset is a no-op.
        {
            let stream = bt.codec_mut("1").unwrap().stream_mut().unwrap();
            stream.write(b"again")?;
        }
        bt.reset();
        assert_eq!(bt.codec("1").unwrap().stream().unwrap().len(), 5);

        // A tx arms it again.
        let _ = bt.tx("3")?;
        bt.reset();
        assert_eq!(bt.codec("1").unwrap().stream().unwrap().len(), 0);
        Ok(())
    }

    #[test]
    fn rx_tx_loop_roundtrips_a_frame() -> Result<()> {
        let mut bt = topology_with_codec();

        // Write a frame as a peer node and flush it to the stream.
        let nc = bt.codec_mut("1").unwrap();
        nc.config("node_id", "8")?;
        let msg = CanMessage {
            frame_id: 42,
            payload: b"Hello World",
            ..Default::default()
        };
        nc.as_can().unwrap().write(&msg)?;
        let flushed = nc.flush()?;
        nc.config("node_id", "2")?;

        // TX: snapshot the stream through the Ascii85 encoder.
        let text = bt.tx("3")?.expect("tx data").to_vec();
        let image = bt.codec("1").unwrap().stream().unwrap().buffer().to_vec();
        assert_eq!(text, ascii85::encode(&image).into_bytes());

        // Reset, then RX the text back into the (now empty) stream.
        bt.reset();
        assert_eq!(bt.codec("1").unwrap().tell()?, 0);
        bt.rx("2", &text)?;
        let codec = bt.codec_mut("1").unwrap();
        assert_eq!(codec.tell()?, 0);
        assert_eq!(codec.stream().unwrap().len(), flushed);

        // The frame decodes intact.
        let m = codec.as_can().unwrap().read()?;
        assert_eq!(m.frame_id, 42);
        assert_eq!(m.payload, b"Hello World");
        assert_eq!(m.sender.node_id, 8);
        Ok(())
    }
}
