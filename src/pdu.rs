/*! PDU codec (`interface=stream; type=pdu; schema=fbs`).

A PDU is a payload plus a transport envelope: nothing, CAN message
metadata, IP message metadata (with nested address and socket-adapter
unions), or a struct-object descriptor. The stream layout matches the CAN
frame codec: outgoing PDUs accumulate in a batch serialized by
[`PduCodec::flush`] as one size-prefixed record; reads iterate records and
their inner vectors, skipping PDUs sent by this codec's own software
component.
*/
use std::fmt;

use log::debug;

use crate::codec::CodecBase;
use crate::fbs::{self, Builder, Table};
use crate::stream::{SeekOp, Stream};
use crate::{Error, Result};

/// File identifier of PDU stream records.
const IDENT: &[u8; 4] = b"SPDU";

// Stream table.
const STREAM_PDUS: u16 = 0;
// Pdu table.
const PDU_ID: u16 = 0;
const PDU_PAYLOAD: u16 = 1;
const PDU_SWC_ID: u16 = 2;
const PDU_ECU_ID: u16 = 3;
const PDU_TRANSPORT_TYPE: u16 = 4;
const PDU_TRANSPORT: u16 = 5;
const TRANSPORT_UNION_CAN: u8 = 1;
const TRANSPORT_UNION_IP: u8 = 2;
const TRANSPORT_UNION_STRUCT: u8 = 3;
// CanMessageMetadata table.
const CANMETA_MESSAGE_FORMAT: u16 = 0;
const CANMETA_FRAME_TYPE: u16 = 1;
const CANMETA_INTERFACE_ID: u16 = 2;
const CANMETA_NETWORK_ID: u16 = 3;
// IpMessageMetadata table.
const IPMETA_ETH_DST_MAC: u16 = 0;
const IPMETA_ETH_SRC_MAC: u16 = 1;
const IPMETA_ETH_ETHERTYPE: u16 = 2;
const IPMETA_ETH_TCI_PCP: u16 = 3;
const IPMETA_ETH_TCI_DEI: u16 = 4;
const IPMETA_ETH_TCI_VID: u16 = 5;
const IPMETA_IP_ADDR_TYPE: u16 = 6;
const IPMETA_IP_ADDR: u16 = 7;
const IPMETA_IP_PROTOCOL: u16 = 8;
const IPMETA_IP_SRC_PORT: u16 = 9;
const IPMETA_IP_DST_PORT: u16 = 10;
const IPMETA_ADAPTER_TYPE: u16 = 11;
const IPMETA_ADAPTER: u16 = 12;
const IPADDR_UNION_V4: u8 = 1;
const IPADDR_UNION_V6: u8 = 2;
const ADAPTER_UNION_DOIP: u8 = 1;
const ADAPTER_UNION_SOMEIP: u8 = 2;
// IpV4 table.
const IPV4_SRC_ADDR: u16 = 0;
const IPV4_DST_ADDR: u16 = 1;
// IpV6 table: src/dst are inline structs of eight 16-bit words.
const IPV6_SRC_ADDR: u16 = 0;
const IPV6_DST_ADDR: u16 = 1;
const IPV6_ADDR_LEN: usize = 16;
// DoIpMetadata table.
const DOIP_PROTOCOL_VERSION: u16 = 0;
const DOIP_PAYLOAD_TYPE: u16 = 1;
// SomeIpMetadata table.
const SOMEIP_MESSAGE_ID: u16 = 0;
const SOMEIP_LENGTH: u16 = 1;
const SOMEIP_REQUEST_ID: u16 = 2;
const SOMEIP_PROTOCOL_VERSION: u16 = 3;
const SOMEIP_INTERFACE_VERSION: u16 = 4;
const SOMEIP_MESSAGE_TYPE: u16 = 5;
const SOMEIP_RETURN_CODE: u16 = 6;
// StructMetadata table.
const STRUCT_TYPE_NAME: u16 = 0;
const STRUCT_VAR_NAME: u16 = 1;
const STRUCT_ENCODING: u16 = 2;
const STRUCT_ATTRIBUTE_ALIGNED: u16 = 3;
const STRUCT_ATTRIBUTE_PACKED: u16 = 4;
const STRUCT_PLATFORM_ARCH: u16 = 5;
const STRUCT_PLATFORM_OS: u16 = 6;
const STRUCT_PLATFORM_ABI: u16 = 7;

/// CAN frame format of a PDU's CAN transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CanFrameFormat {
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

impl CanFrameFormat {
    fn from_wire(v: u8) -> Self {
        match v {
            1 => Self::Extended,
            2 => Self::FdBase,
            3 => Self::FdExtended,
            _ => Self::Base,
        }
    }
}

/// CAN frame type of a PDU's CAN transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CanFrameType {
    /// Data frame.
    #[default]
    Data = 0,
    /// Remote request frame.
    Remote = 1,
    /// Error frame.
    Error = 2,
    /// Overload frame.
    Overload = 3,
}

impl CanFrameType {
    fn from_wire(v: u8) -> Self {
        match v {
            1 => Self::Remote,
            2 => Self::Error,
            3 => Self::Overload,
            _ => Self::Data,
        }
    }
}

/// CAN transport metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CanMessageMetadata {
    /// Frame format.
    pub frame_format: CanFrameFormat,
    /// Frame type.
    pub frame_type: CanFrameType,
    /// Sending interface.
    pub interface_id: u32,
    /// Network (bus) identifier.
    pub network_id: u32,
}

/// IP protocol selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpProtocol {
    /// Unspecified.
    #[default]
    None = 0,
    /// TCP.
    Tcp = 6,
    /// UDP.
    Udp = 17,
}

impl IpProtocol {
    fn from_wire(v: u8) -> Self {
        match v {
            6 => Self::Tcp,
            17 => Self::Udp,
            _ => Self::None,
        }
    }
}

/// IP address family union of the IP transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpAddr {
    /// No address.
    #[default]
    None,
    /// IPv4 source and destination.
    V4 {
        /// Source address.
        src_addr: u32,
        /// Destination address.
        dst_addr: u32,
    },
    /// IPv6 source and destination, eight 16-bit words each.
    V6 {
        /// Source address words.
        src_addr: [u16; 8],
        /// Destination address words.
        dst_addr: [u16; 8],
    },
}

/// Socket adapter union of the IP transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SocketAdapter {
    /// No socket adapter.
    #[default]
    None,
    /// ISO 13400 diagnostic communication over IP.
    DoIp {
        /// DoIP protocol version.
        protocol_version: u8,
        /// DoIP payload type.
        payload_type: u16,
    },
    /// AUTOSAR SOME/IP.
    SomeIp {
        /// Message identifier.
        message_id: u32,
        /// Length field.
        length: u32,
        /// Request identifier.
        request_id: u32,
        /// Protocol version.
        protocol_version: u8,
        /// Interface version.
        interface_version: u8,
        /// Message type.
        message_type: u8,
        /// Return code.
        return_code: u8,
    },
}

/// IP/Ethernet transport metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpMessageMetadata {
    /// Destination MAC.
    pub eth_dst_mac: u64,
    /// Source MAC.
    pub eth_src_mac: u64,
    /// Ethertype.
    pub eth_ethertype: u16,
    /// VLAN tag: priority code point.
    pub eth_tci_pcp: u8,
    /// VLAN tag: drop eligible indicator.
    pub eth_tci_dei: u8,
    /// VLAN tag: VLAN identifier.
    pub eth_tci_vid: u16,
    /// IP protocol.
    pub ip_protocol: IpProtocol,
    /// Address family union.
    pub ip_addr: IpAddr,
    /// Source port.
    pub ip_src_port: u16,
    /// Destination port.
    pub ip_dst_port: u16,
    /// Socket adapter union.
    pub socket_adapter: SocketAdapter,
}

/// Struct-object transport metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructMetadata<'a> {
    /// Type name of the exchanged object.
    pub type_name: &'a str,
    /// Variable name.
    pub var_name: &'a str,
    /// Object encoding.
    pub encoding: &'a str,
    /// Alignment attribute of the type.
    pub attribute_aligned: u16,
    /// Packed attribute of the type.
    pub attribute_packed: bool,
    /// Platform architecture the object was produced on.
    pub platform_arch: &'a str,
    /// Platform operating system.
    pub platform_os: &'a str,
    /// Platform ABI.
    pub platform_abi: &'a str,
}

/// The transport envelope of a PDU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PduTransport<'a> {
    /// No transport metadata.
    #[default]
    None,
    /// CAN transport.
    Can(CanMessageMetadata),
    /// IP/Ethernet transport.
    Ip(IpMessageMetadata),
    /// Struct-object transport.
    Struct(StructMetadata<'a>),
}

/// One PDU.
///
/// On write, `swc_id`/`ecu_id` values of 0 are replaced by the codec's
/// configured identity. On read, all fields reflect the wire content and
/// the payload borrows the codec's parse state: copy it to keep it past
/// the next codec call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pdu<'a> {
    /// PDU identifier.
    pub id: u32,
    /// PDU payload.
    pub payload: &'a [u8],
    /// Sending software component; 0 means unidentified.
    pub swc_id: u32,
    /// Sending electronic control unit.
    pub ecu_id: u32,
    /// Transport envelope.
    pub transport: PduTransport<'a>,
}

/// Observation hooks, called after each successful write or read.
#[derive(Default)]
pub struct PduTrace {
    /// Called with each PDU accepted by `write`.
    pub write: Option<Box<dyn FnMut(&Pdu<'_>)>>,
    /// Called with each PDU yielded by `read`.
    pub read: Option<Box<dyn FnMut(&Pdu<'_>)>>,
}

impl PduTrace {
    /// Hooks that emit one `debug!` line per traced PDU.
    #[must_use]
    pub fn log() -> Self {
        Self {
            write: Some(Box::new(|p| {
                debug!("tx pdu {:#x} len {}", p.id, p.payload.len());
            })),
            read: Some(Box::new(|p| {
                debug!("rx pdu {:#x} len {} swc {}", p.id, p.payload.len(), p.swc_id);
            })),
        }
    }
}

impl fmt::Debug for PduTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduTrace")
            .field("write", &self.write.is_some())
            .field("read", &self.read.is_some())
            .finish()
    }
}

#[derive(Debug)]
struct PduItem {
    id: u32,
    payload: Vec<u8>,
    swc_id: u32,
    ecu_id: u32,
    transport: TransportItem,
}

#[derive(Debug)]
enum TransportItem {
    None,
    Can(CanMessageMetadata),
    Ip(IpMessageMetadata),
    Struct(StructItem),
}

#[derive(Debug)]
struct StructItem {
    type_name: String,
    var_name: String,
    encoding: String,
    attribute_aligned: u16,
    attribute_packed: bool,
    platform_arch: String,
    platform_os: String,
    platform_abi: String,
}

impl TransportItem {
    fn tag(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Can(_) => TRANSPORT_UNION_CAN,
            Self::Ip(_) => TRANSPORT_UNION_IP,
            Self::Struct(_) => TRANSPORT_UNION_STRUCT,
        }
    }
}

impl From<&PduTransport<'_>> for TransportItem {
    fn from(t: &PduTransport<'_>) -> Self {
        match t {
            PduTransport::None => Self::None,
            PduTransport::Can(m) => Self::Can(*m),
            PduTransport::Ip(m) => Self::Ip(*m),
            PduTransport::Struct(m) => Self::Struct(StructItem {
                type_name: m.type_name.to_owned(),
                var_name: m.var_name.to_owned(),
                encoding: m.encoding.to_owned(),
                attribute_aligned: m.attribute_aligned,
                attribute_packed: m.attribute_packed,
                platform_arch: m.platform_arch.to_owned(),
                platform_os: m.platform_os.to_owned(),
                platform_abi: m.platform_abi.to_owned(),
            }),
        }
    }
}

/// The PDU codec.
#[derive(Debug)]
pub struct PduCodec<S: Stream> {
    pub(crate) base: CodecBase<S>,
    batch: Option<Vec<PduItem>>,
    trace: PduTrace,
}

impl<S: Stream> PduCodec<S> {
    pub(crate) fn new(mime_type: &str, params: crate::codec::Params) -> Self {
        Self {
            base: CodecBase::new(mime_type, params),
            batch: None,
            trace: PduTrace::default(),
        }
    }

    /// Install observation hooks.
    pub fn set_trace(&mut self, trace: PduTrace) {
        self.trace = trace;
    }

    /// Append one PDU to the outgoing batch. The first write after a
    /// `flush` or `truncate` opens a new batch. The stream is not touched.
    ///
    /// Returns the payload length.
    pub fn write(&mut self, msg: &Pdu<'_>) -> Result<usize> {
        self.base.require_stream()?;
        let p = &self.base.params;
        let item = PduItem {
            id: msg.id,
            payload: msg.payload.to_vec(),
            swc_id: if msg.swc_id != 0 { msg.swc_id } else { p.swc_id },
            ecu_id: if msg.ecu_id != 0 { msg.ecu_id } else { p.ecu_id },
            transport: TransportItem::from(&msg.transport),
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

    /// Yield the next PDU from the stream.
    ///
    /// PDUs whose `swc_id` equals this codec's configured non-zero
    /// `swc_id` are skipped. An exhausted stream reports
    /// [`Error::NoMessage`] with the cursor at the stream end.
    ///
    /// The returned payload borrows the codec's parse state and is only
    /// valid until the next codec call.
    pub fn read(&mut self) -> Result<Pdu<'_>> {
        self.base.require_stream()?;
        let swc_id = self.base.params.swc_id;
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
                .and_then(|body| scan_pdus(body, start, swc_id));
            match scan {
                Some(i) => break i,
                None => self.base.parse.clear(),
            }
        };
        self.base.parse.idx = found + 1;
        let body = self.base.parse.body.as_deref().unwrap_or_default();
        let msg = decode_pdu(body, found).ok_or(Error::NoMessage)?;
        if let Some(f) = &mut self.trace.read {
            f(&msg);
        }
        Ok(msg)
    }
}

// ---------------------------------------------------------------------
// Encode.
// ---------------------------------------------------------------------

fn encode_record(items: &[PduItem]) -> Vec<u8> {
    let mut b = Builder::new(IDENT);
    let mut stream_t = b.start_table();
    let pdus_slot = b.field_ref(&mut stream_t, STREAM_PDUS);
    let root = b.end_table(stream_t);
    let (vec_pos, slots) = b.ref_vector(items.len());
    b.patch(pdus_slot, vec_pos);
    for (item, slot) in items.iter().zip(slots) {
        let tag = item.transport.tag();
        let mut pdu_t = b.start_table();
        b.field_u32(&mut pdu_t, PDU_ID, item.id, 0);
        let payload_slot = b.field_ref(&mut pdu_t, PDU_PAYLOAD);
        b.field_u32(&mut pdu_t, PDU_SWC_ID, item.swc_id, 0);
        b.field_u32(&mut pdu_t, PDU_ECU_ID, item.ecu_id, 0);
        b.field_u8(&mut pdu_t, PDU_TRANSPORT_TYPE, tag, 0);
        let transport_slot = (tag != 0).then(|| b.field_ref(&mut pdu_t, PDU_TRANSPORT));
        let pdu_pos = b.end_table(pdu_t);
        b.patch(slot, pdu_pos);

        let payload_pos = b.byte_vector(&item.payload);
        b.patch(payload_slot, payload_pos);
        if let Some(tslot) = transport_slot {
            if let Some(pos) = encode_transport(&mut b, &item.transport) {
                b.patch(tslot, pos);
            }
        }
    }
    b.finish(root)
}

fn encode_transport(b: &mut Builder, transport: &TransportItem) -> Option<usize> {
    match transport {
        TransportItem::None => None,
        TransportItem::Can(m) => Some(encode_can_meta(b, m)),
        TransportItem::Ip(m) => Some(encode_ip_meta(b, m)),
        TransportItem::Struct(m) => Some(encode_struct_meta(b, m)),
    }
}

fn encode_can_meta(b: &mut Builder, m: &CanMessageMetadata) -> usize {
    let mut t = b.start_table();
    b.field_u8(&mut t, CANMETA_MESSAGE_FORMAT, m.frame_format as u8, 0);
    b.field_u8(&mut t, CANMETA_FRAME_TYPE, m.frame_type as u8, 0);
    b.field_u32(&mut t, CANMETA_INTERFACE_ID, m.interface_id, 0);
    b.field_u32(&mut t, CANMETA_NETWORK_ID, m.network_id, 0);
    b.end_table(t)
}

fn encode_ip_meta(b: &mut Builder, m: &IpMessageMetadata) -> usize {
    let addr_tag = match m.ip_addr {
        IpAddr::None => 0,
        IpAddr::V4 { .. } => IPADDR_UNION_V4,
        IpAddr::V6 { .. } => IPADDR_UNION_V6,
    };
    let adapter_tag = match m.socket_adapter {
        SocketAdapter::None => 0,
        SocketAdapter::DoIp { .. } => ADAPTER_UNION_DOIP,
        SocketAdapter::SomeIp { .. } => ADAPTER_UNION_SOMEIP,
    };

    let mut t = b.start_table();
    b.field_u64(&mut t, IPMETA_ETH_DST_MAC, m.eth_dst_mac, 0);
    b.field_u64(&mut t, IPMETA_ETH_SRC_MAC, m.eth_src_mac, 0);
    b.field_u16(&mut t, IPMETA_ETH_ETHERTYPE, m.eth_ethertype, 0);
    b.field_u8(&mut t, IPMETA_ETH_TCI_PCP, m.eth_tci_pcp, 0);
    b.field_u8(&mut t, IPMETA_ETH_TCI_DEI, m.eth_tci_dei, 0);
    b.field_u16(&mut t, IPMETA_ETH_TCI_VID, m.eth_tci_vid, 0);
    b.field_u8(&mut t, IPMETA_IP_ADDR_TYPE, addr_tag, 0);
    let addr_slot = (addr_tag != 0).then(|| b.field_ref(&mut t, IPMETA_IP_ADDR));
    b.field_u8(&mut t, IPMETA_IP_PROTOCOL, m.ip_protocol as u8, 0);
    b.field_u16(&mut t, IPMETA_IP_SRC_PORT, m.ip_src_port, 0);
    b.field_u16(&mut t, IPMETA_IP_DST_PORT, m.ip_dst_port, 0);
    b.field_u8(&mut t, IPMETA_ADAPTER_TYPE, adapter_tag, 0);
    let adapter_slot = (adapter_tag != 0).then(|| b.field_ref(&mut t, IPMETA_ADAPTER));
    let pos = b.end_table(t);

    if let Some(slot) = addr_slot {
        if let Some(apos) = encode_ip_addr(b, &m.ip_addr) {
            b.patch(slot, apos);
        }
    }
    if let Some(slot) = adapter_slot {
        if let Some(apos) = encode_adapter(b, &m.socket_adapter) {
            b.patch(slot, apos);
        }
    }
    pos
}

fn encode_ip_addr(b: &mut Builder, addr: &IpAddr) -> Option<usize> {
    match *addr {
        IpAddr::None => None,
        IpAddr::V4 { src_addr, dst_addr } => {
            let mut t = b.start_table();
            b.field_u32(&mut t, IPV4_SRC_ADDR, src_addr, 0);
            b.field_u32(&mut t, IPV4_DST_ADDR, dst_addr, 0);
            Some(b.end_table(t))
        }
        IpAddr::V6 { src_addr, dst_addr } => {
            let mut t = b.start_table();
            b.field_struct(&mut t, IPV6_SRC_ADDR, &v6_words_to_bytes(&src_addr), 2);
            b.field_struct(&mut t, IPV6_DST_ADDR, &v6_words_to_bytes(&dst_addr), 2);
            Some(b.end_table(t))
        }
    }
}

fn encode_adapter(b: &mut Builder, adapter: &SocketAdapter) -> Option<usize> {
    match *adapter {
        SocketAdapter::None => None,
        SocketAdapter::DoIp {
            protocol_version,
            payload_type,
        } => {
            let mut t = b.start_table();
            b.field_u8(&mut t, DOIP_PROTOCOL_VERSION, protocol_version, 0);
            b.field_u16(&mut t, DOIP_PAYLOAD_TYPE, payload_type, 0);
            Some(b.end_table(t))
        }
        SocketAdapter::SomeIp {
            message_id,
            length,
            request_id,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        } => {
            let mut t = b.start_table();
            b.field_u32(&mut t, SOMEIP_MESSAGE_ID, message_id, 0);
            b.field_u32(&mut t, SOMEIP_LENGTH, length, 0);
            b.field_u32(&mut t, SOMEIP_REQUEST_ID, request_id, 0);
            b.field_u8(&mut t, SOMEIP_PROTOCOL_VERSION, protocol_version, 0);
            b.field_u8(&mut t, SOMEIP_INTERFACE_VERSION, interface_version, 0);
            b.field_u8(&mut t, SOMEIP_MESSAGE_TYPE, message_type, 0);
            b.field_u8(&mut t, SOMEIP_RETURN_CODE, return_code, 0);
            Some(b.end_table(t))
        }
    }
}

fn encode_struct_meta(b: &mut Builder, m: &StructItem) -> usize {
    let mut t = b.start_table();
    let type_name_slot = b.field_ref(&mut t, STRUCT_TYPE_NAME);
    let var_name_slot = b.field_ref(&mut t, STRUCT_VAR_NAME);
    let encoding_slot = b.field_ref(&mut t, STRUCT_ENCODING);
    b.field_u16(&mut t, STRUCT_ATTRIBUTE_ALIGNED, m.attribute_aligned, 0);
    b.field_bool(&mut t, STRUCT_ATTRIBUTE_PACKED, m.attribute_packed, false);
    let arch_slot = b.field_ref(&mut t, STRUCT_PLATFORM_ARCH);
    let os_slot = b.field_ref(&mut t, STRUCT_PLATFORM_OS);
    let abi_slot = b.field_ref(&mut t, STRUCT_PLATFORM_ABI);
    let pos = b.end_table(t);
    for (slot, s) in [
        (type_name_slot, &m.type_name),
        (var_name_slot, &m.var_name),
        (encoding_slot, &m.encoding),
        (arch_slot, &m.platform_arch),
        (os_slot, &m.platform_os),
        (abi_slot, &m.platform_abi),
    ] {
        let spos = b.string(s);
        b.patch(slot, spos);
    }
    pos
}

fn v6_words_to_bytes(words: &[u16; 8]) -> [u8; IPV6_ADDR_LEN] {
    let mut out = [0u8; IPV6_ADDR_LEN];
    for (i, w) in words.iter().enumerate() {
        out[2 * i..2 * i + 2].copy_from_slice(&w.to_le_bytes());
    }
    out
}

// ---------------------------------------------------------------------
// Decode.
// ---------------------------------------------------------------------

/// Find the next surviving PDU at or after `start`, skipping loopback.
fn scan_pdus(body: &[u8], start: usize, swc_id: u32) -> Option<usize> {
    let root = fbs::root_table(body, IDENT)?;
    let pdus = root.get_vector(STREAM_PDUS)?;
    for i in start..pdus.len() {
        let Some(pdu) = pdus.table(i) else {
            continue;
        };
        if swc_id != 0 && pdu.get_u32(PDU_SWC_ID, 0) == swc_id {
            continue;
        }
        return Some(i);
    }
    None
}

fn decode_pdu(body: &[u8], i: usize) -> Option<Pdu<'_>> {
    let root = fbs::root_table(body, IDENT)?;
    let pdu = root.get_vector(STREAM_PDUS)?.table(i)?;
    Some(Pdu {
        id: pdu.get_u32(PDU_ID, 0),
        payload: pdu.get_bytes(PDU_PAYLOAD).unwrap_or_default(),
        swc_id: pdu.get_u32(PDU_SWC_ID, 0),
        ecu_id: pdu.get_u32(PDU_ECU_ID, 0),
        transport: decode_transport(pdu),
    })
}

fn decode_transport(pdu: Table<'_>) -> PduTransport<'_> {
    let Some(t) = pdu.get_table(PDU_TRANSPORT) else {
        return PduTransport::None;
    };
    match pdu.get_u8(PDU_TRANSPORT_TYPE, 0) {
        TRANSPORT_UNION_CAN => PduTransport::Can(decode_can_meta(t)),
        TRANSPORT_UNION_IP => PduTransport::Ip(decode_ip_meta(t)),
        TRANSPORT_UNION_STRUCT => PduTransport::Struct(decode_struct_meta(t)),
        _ => PduTransport::None,
    }
}

fn decode_can_meta(t: Table<'_>) -> CanMessageMetadata {
    CanMessageMetadata {
        frame_format: CanFrameFormat::from_wire(t.get_u8(CANMETA_MESSAGE_FORMAT, 0)),
        frame_type: CanFrameType::from_wire(t.get_u8(CANMETA_FRAME_TYPE, 0)),
        interface_id: t.get_u32(CANMETA_INTERFACE_ID, 0),
        network_id: t.get_u32(CANMETA_NETWORK_ID, 0),
    }
}

fn decode_ip_meta(t: Table<'_>) -> IpMessageMetadata {
    IpMessageMetadata {
        eth_dst_mac: t.get_u64(IPMETA_ETH_DST_MAC, 0),
        eth_src_mac: t.get_u64(IPMETA_ETH_SRC_MAC, 0),
        eth_ethertype: t.get_u16(IPMETA_ETH_ETHERTYPE, 0),
        eth_tci_pcp: t.get_u8(IPMETA_ETH_TCI_PCP, 0),
        eth_tci_dei: t.get_u8(IPMETA_ETH_TCI_DEI, 0),
        eth_tci_vid: t.get_u16(IPMETA_ETH_TCI_VID, 0),
        ip_protocol: IpProtocol::from_wire(t.get_u8(IPMETA_IP_PROTOCOL, 0)),
        ip_addr: decode_ip_addr(t),
        ip_src_port: t.get_u16(IPMETA_IP_SRC_PORT, 0),
        ip_dst_port: t.get_u16(IPMETA_IP_DST_PORT, 0),
        socket_adapter: decode_adapter(t),
    }
}

fn decode_ip_addr(t: Table<'_>) -> IpAddr {
    let Some(addr) = t.get_table(IPMETA_IP_ADDR) else {
        return IpAddr::None;
    };
    match t.get_u8(IPMETA_IP_ADDR_TYPE, 0) {
        IPADDR_UNION_V4 => IpAddr::V4 {
            src_addr: addr.get_u32(IPV4_SRC_ADDR, 0),
            dst_addr: addr.get_u32(IPV4_DST_ADDR, 0),
        },
        IPADDR_UNION_V6 => IpAddr::V6 {
            src_addr: v6_bytes_to_words(addr.get_struct(IPV6_SRC_ADDR, IPV6_ADDR_LEN)),
            dst_addr: v6_bytes_to_words(addr.get_struct(IPV6_DST_ADDR, IPV6_ADDR_LEN)),
        },
        _ => IpAddr::None,
    }
}

fn decode_adapter(t: Table<'_>) -> SocketAdapter {
    let Some(ad) = t.get_table(IPMETA_ADAPTER) else {
        return SocketAdapter::None;
    };
    match t.get_u8(IPMETA_ADAPTER_TYPE, 0) {
        ADAPTER_UNION_DOIP => SocketAdapter::DoIp {
            protocol_version: ad.get_u8(DOIP_PROTOCOL_VERSION, 0),
            payload_type: ad.get_u16(DOIP_PAYLOAD_TYPE, 0),
        },
        ADAPTER_UNION_SOMEIP => SocketAdapter::SomeIp {
            message_id: ad.get_u32(SOMEIP_MESSAGE_ID, 0),
            length: ad.get_u32(SOMEIP_LENGTH, 0),
            request_id: ad.get_u32(SOMEIP_REQUEST_ID, 0),
            protocol_version: ad.get_u8(SOMEIP_PROTOCOL_VERSION, 0),
            interface_version: ad.get_u8(SOMEIP_INTERFACE_VERSION, 0),
            message_type: ad.get_u8(SOMEIP_MESSAGE_TYPE, 0),
            return_code: ad.get_u8(SOMEIP_RETURN_CODE, 0),
        },
        _ => SocketAdapter::None,
    }
}

fn decode_struct_meta(t: Table<'_>) -> StructMetadata<'_> {
    StructMetadata {
        type_name: t.get_str(STRUCT_TYPE_NAME).unwrap_or_default(),
        var_name: t.get_str(STRUCT_VAR_NAME).unwrap_or_default(),
        encoding: t.get_str(STRUCT_ENCODING).unwrap_or_default(),
        attribute_aligned: t.get_u16(STRUCT_ATTRIBUTE_ALIGNED, 0),
        attribute_packed: t.get_bool(STRUCT_ATTRIBUTE_PACKED, false),
        platform_arch: t.get_str(STRUCT_PLATFORM_ARCH).unwrap_or_default(),
        platform_os: t.get_str(STRUCT_PLATFORM_OS).unwrap_or_default(),
        platform_abi: t.get_str(STRUCT_PLATFORM_ABI).unwrap_or_default(),
    }
}

fn v6_bytes_to_words(bytes: Option<&[u8]>) -> [u16; 8] {
    let mut words = [0u16; 8];
    if let Some(b) = bytes {
        for (i, w) in words.iter_mut().enumerate() {
            *w = u16::from_le_bytes([b[2 * i], b[2 * i + 1]]);
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NCodec;
    use crate::stream::MemoryStream;

    const MIME: &str = "application/x-automotive-bus; \
        interface=stream;type=pdu;schema=fbs;swc_id=4;ecu_id=5";
    const GREETING: &[u8] = b"Hello World";

    fn open_pdu(capacity: usize) -> NCodec<MemoryStream> {
        NCodec::open(MIME, MemoryStream::new(capacity)).unwrap()
    }

    /// Write PDUs as a peer component, then swing the codec identity back
    /// so the loopback filter lets them through on read.
    fn write_as_peer(nc: &mut NCodec<MemoryStream>, pdus: &[Pdu<'_>]) -> usize {
        nc.config("swc_id", "99").unwrap();
        for pdu in pdus {
            nc.as_pdu().unwrap().write(pdu).unwrap();
        }
        let n = nc.flush().unwrap();
        nc.config("swc_id", "4").unwrap();
        nc.seek(0, SeekOp::Set).unwrap();
        n
    }

    #[test]
    fn no_stream_bound() {
        let mut nc = NCodec::<MemoryStream>::create(MIME).unwrap();
        let pdu = nc.as_pdu().unwrap();
        let msg = Pdu {
            id: 42,
            payload: GREETING,
            ..Default::default()
        };
        assert!(matches!(pdu.write(&msg), Err(Error::NoStreamResource)));
        assert!(matches!(pdu.flush(), Err(Error::NoStreamResource)));
        assert!(matches!(pdu.read(), Err(Error::NoStreamResource)));
    }

    #[test]
    fn write_uses_configured_identity_for_zero_ids() -> Result<()> {
        let mut nc = open_pdu(512);
        // swc_id 0 takes the configured value; explicit values win.
        write_as_peer(
            &mut nc,
            &[
                Pdu {
                    id: 1,
                    payload: GREETING,
                    ..Default::default()
                },
                Pdu {
                    id: 2,
                    payload: GREETING,
                    swc_id: 7,
                    ecu_id: 9,
                    ..Default::default()
                },
            ],
        );
        let pdu = nc.as_pdu().unwrap();
        let m = pdu.read()?;
        assert_eq!((m.id, m.swc_id, m.ecu_id), (1, 99, 5));
        let m = pdu.read()?;
        assert_eq!((m.id, m.swc_id, m.ecu_id), (2, 7, 9));
        Ok(())
    }

    #[test]
    fn read_skips_own_swc() -> Result<()> {
        let mut nc = open_pdu(256);
        let msg = Pdu {
            id: 42,
            payload: GREETING,
            ..Default::default()
        };
        nc.as_pdu().unwrap().write(&msg)?;
        nc.flush()?;
        nc.seek(0, SeekOp::Set)?;
        // Written with swc_id 4 (from config), read with swc_id 4.
        assert!(matches!(nc.as_pdu().unwrap().read(), Err(Error::NoMessage)));
        assert_eq!(nc.tell()?, nc.stream().unwrap().len() as u64);
        Ok(())
    }

    #[test]
    fn transport_none_roundtrip() -> Result<()> {
        let mut nc = open_pdu(256);
        write_as_peer(
            &mut nc,
            &[Pdu {
                id: 42,
                payload: GREETING,
                ..Default::default()
            }],
        );
        let m = nc.as_pdu().unwrap().read()?;
        assert_eq!(m.id, 42);
        assert_eq!(m.payload, GREETING);
        assert_eq!(m.transport, PduTransport::None);
        Ok(())
    }

    #[test]
    fn transport_can_roundtrip() -> Result<()> {
        let meta = CanMessageMetadata {
            frame_format: CanFrameFormat::FdExtended,
            frame_type: CanFrameType::Data,
            interface_id: 3,
            network_id: 7,
        };
        let mut nc = open_pdu(256);
        write_as_peer(
            &mut nc,
            &[Pdu {
                id: 42,
                payload: GREETING,
                transport: PduTransport::Can(meta),
                ..Default::default()
            }],
        );
        let m = nc.as_pdu().unwrap().read()?;
        assert_eq!(m.transport, PduTransport::Can(meta));
        Ok(())
    }

    #[test]
    fn transport_ip_v4_doip_roundtrip() -> Result<()> {
        let meta = IpMessageMetadata {
            eth_dst_mac: 0x0000_123456789abc,
            eth_src_mac: 0x0000_cba987654321,
            eth_ethertype: 0x0800,
            eth_tci_pcp: 3,
            eth_tci_dei: 1,
            eth_tci_vid: 100,
            ip_protocol: IpProtocol::Udp,
            ip_addr: IpAddr::V4 {
                src_addr: 0xc0a8_0001,
                dst_addr: 0xc0a8_0002,
            },
            ip_src_port: 13400,
            ip_dst_port: 13400,
            socket_adapter: SocketAdapter::DoIp {
                protocol_version: 2,
                payload_type: 0x8001,
            },
        };
        let mut nc = open_pdu(512);
        write_as_peer(
            &mut nc,
            &[Pdu {
                id: 24,
                payload: GREETING,
                transport: PduTransport::Ip(meta),
                ..Default::default()
            }],
        );
        let m = nc.as_pdu().unwrap().read()?;
        assert_eq!(m.transport, PduTransport::Ip(meta));
        Ok(())
    }

    #[test]
    fn transport_ip_v6_someip_roundtrip() -> Result<()> {
        let meta = IpMessageMetadata {
            eth_ethertype: 0x86dd,
            ip_protocol: IpProtocol::Tcp,
            ip_addr: IpAddr::V6 {
                src_addr: [0xfe80, 0, 0, 0, 1, 2, 3, 4],
                dst_addr: [0xfe80, 0, 0, 0, 5, 6, 7, 8],
            },
            ip_src_port: 30490,
            ip_dst_port: 30501,
            socket_adapter: SocketAdapter::SomeIp {
                message_id: 0x1234_5678,
                length: 64,
                request_id: 0x0001_0001,
                protocol_version: 1,
                interface_version: 2,
                message_type: 0x80,
                return_code: 0,
            },
            ..Default::default()
        };
        let mut nc = open_pdu(512);
        write_as_peer(
            &mut nc,
            &[Pdu {
                id: 77,
                payload: b"ip pdu",
                transport: PduTransport::Ip(meta),
                ..Default::default()
            }],
        );
        let m = nc.as_pdu().unwrap().read()?;
        assert_eq!(m.transport, PduTransport::Ip(meta));
        Ok(())
    }

    #[test]
    fn transport_struct_roundtrip() -> Result<()> {
        let meta = StructMetadata {
            type_name: "VehicleState",
            var_name: "vehicle_state",
            encoding: "packed",
            attribute_aligned: 8,
            attribute_packed: true,
            platform_arch: "x86_64",
            platform_os: "linux",
            platform_abi: "gnu",
        };
        let mut nc = open_pdu(512);
        write_as_peer(
            &mut nc,
            &[Pdu {
                id: 9,
                payload: &[0xde, 0xad, 0xbe, 0xef],
                transport: PduTransport::Struct(meta),
                ..Default::default()
            }],
        );
        let m = nc.as_pdu().unwrap().read()?;
        assert_eq!(m.transport, PduTransport::Struct(meta));
        Ok(())
    }

    #[test]
    fn mixed_transports_keep_order() -> Result<()> {
        let mut nc = open_pdu(1024);
        write_as_peer(
            &mut nc,
            &[
                Pdu {
                    id: 1,
                    payload: b"one",
                    ..Default::default()
                },
                Pdu {
                    id: 2,
                    payload: b"two",
                    transport: PduTransport::Can(CanMessageMetadata {
                        frame_format: CanFrameFormat::Extended,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                Pdu {
                    id: 3,
                    payload: b"three",
                    transport: PduTransport::Ip(IpMessageMetadata {
                        ip_protocol: IpProtocol::Tcp,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ],
        );
        let pdu = nc.as_pdu().unwrap();
        for (id, payload) in [(1u32, &b"one"[..]), (2, b"two"), (3, b"three")] {
            let m = pdu.read()?;
            assert_eq!(m.id, id);
            assert_eq!(m.payload, payload);
        }
        assert!(matches!(pdu.read(), Err(Error::NoMessage)));
        Ok(())
    }

    #[test]
    fn records_concatenate_on_the_stream() -> Result<()> {
        let mut nc = open_pdu(512);
        nc.config("swc_id", "99")?;
        nc.as_pdu()
            .unwrap()
            .write(&Pdu {
                id: 1,
                payload: GREETING,
                ..Default::default()
            })?;
        let n1 = nc.flush()?;
        nc.as_pdu()
            .unwrap()
            .write(&Pdu {
                id: 2,
                payload: b"Foo Bar",
                ..Default::default()
            })?;
        let n2 = nc.flush()?;
        assert!(n1 > 0 && n2 > 0);
        assert_eq!(nc.tell()?, (n1 + n2) as u64);
        nc.config("swc_id", "4")?;

        nc.seek(0, SeekOp::Set)?;
        let pdu = nc.as_pdu().unwrap();
        assert_eq!(pdu.read()?.id, 1);
        assert_eq!(pdu.read()?.id, 2);
        assert!(matches!(pdu.read(), Err(Error::NoMessage)));
        Ok(())
    }

    #[test]
    fn truncate_discards_batch_and_stream() -> Result<()> {
        let mut nc = open_pdu(256);
        nc.as_pdu()
            .unwrap()
            .write(&Pdu {
                id: 1,
                payload: GREETING,
                ..Default::default()
            })?;
        nc.truncate()?;
        assert_eq!(nc.tell()?, 0);
        assert_eq!(nc.flush()?, 0);
        assert_eq!(nc.tell()?, 0);
        Ok(())
    }

    #[test]
    fn flush_without_write_is_noop() -> Result<()> {
        let mut nc = open_pdu(256);
        assert_eq!(nc.flush()?, 0);
        Ok(())
    }
}
