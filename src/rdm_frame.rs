//! RDM frame staging, serialization helpers and validation.
//!
//! The [FrameBuffer] is the staging area shared between the transceiver and
//! the responder: the transceiver owns it while a frame is on the wire, the
//! responder owns it while building a reply, and the reply length returned by
//! a handler is the hand-off token between the two.

use crate::command_class::ResponseCommandClass;
use crate::consts::{
    DUB_RESPONSE_LENGTH, PREAMBLE_BYTE, PREAMBLE_LENGTH, RDM_CHECKSUM_LENGTH, RDM_HEADER_SIZE,
    RDM_MAX_FRAME_SIZE, RDM_MIN_FRAME_SIZE, SC_RDM, SC_SUB_MESSAGE, SEPARATOR_BYTE, UID_LENGTH,
};
use crate::layouts::rdm_frame_layout;
use crate::receiver_counters::ReceiverCounters;
use crate::types::ResponseType;
use crate::unique_identifier::{Destination, Uid};

/// Reasons an incoming frame was rejected.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Fewer bytes than a header and checksum.
    ShortFrame,
    /// The declared message length does not fit the received bytes.
    LengthMismatch,
    /// The additive checksum does not match.
    ChecksumInvalid,
    /// The start code or sub-start code is not RDM.
    NotRdm,
    /// The source uid is a broadcast address.
    SourceUidIsBroadcast,
}

impl core::fmt::Display for FrameError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FrameError::ShortFrame => write!(f, "frame too short"),
            FrameError::LengthMismatch => write!(f, "message length mismatch"),
            FrameError::ChecksumInvalid => write!(f, "checksum mismatch"),
            FrameError::NotRdm => write!(f, "not an rdm start code"),
            FrameError::SourceUidIsBroadcast => write!(f, "source uid is a broadcast"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FrameError {}

/// The fixed 24-byte prefix of every RDM frame, in parsed form.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RdmHeader {
    pub destination: Destination,
    pub source: Uid,
    pub transaction_number: u8,
    pub port_id: u8,
    pub message_count: u8,
    pub sub_device: u16,
    pub command_class: u8,
    pub parameter_id: u16,
    pub parameter_data_length: u8,
}

/// The 16-bit additive checksum over `data`.
#[inline]
pub fn calculate_checksum(data: &[u8]) -> u16 {
    let mut checksum = 0u16;
    for byte in data {
        checksum = checksum.wrapping_add(*byte as u16);
    }
    checksum
}

/// Sum the first `message_length` bytes and write the two checksum bytes
/// after them. Returns the total frame length.
pub fn append_checksum(buffer: &mut [u8], message_length: usize) -> usize {
    let checksum = calculate_checksum(&buffer[..message_length]);
    buffer[message_length..message_length + RDM_CHECKSUM_LENGTH]
        .copy_from_slice(&checksum.to_be_bytes());
    message_length + RDM_CHECKSUM_LENGTH
}

/// Check an incoming frame and parse its header.
///
/// The three countable failure kinds bump the matching receiver counter; a
/// non-RDM start code does not, since the frame simply belongs to another
/// protocol.
pub fn validate(frame: &[u8], counters: &mut ReceiverCounters) -> Result<RdmHeader, FrameError> {
    if frame.len() < RDM_MIN_FRAME_SIZE {
        counters.count_rdm_short_frame();
        return Err(FrameError::ShortFrame);
    }

    let view = rdm_frame_layout::View::new(frame);
    if view.start_code().read() != SC_RDM || view.sub_start_code().read() != SC_SUB_MESSAGE {
        return Err(FrameError::NotRdm);
    }

    let message_length = view.message_length().read() as usize;
    let parameter_data_length = view.parameter_data_length().read() as usize;
    if message_length < RDM_HEADER_SIZE
        || message_length + RDM_CHECKSUM_LENGTH > frame.len()
        || message_length != RDM_HEADER_SIZE + parameter_data_length
    {
        counters.count_rdm_length_mismatch();
        return Err(FrameError::LengthMismatch);
    }

    let expected = calculate_checksum(&frame[..message_length]);
    let received = u16::from_be_bytes([frame[message_length], frame[message_length + 1]]);
    if expected != received {
        counters.count_rdm_checksum_invalid();
        return Err(FrameError::ChecksumInvalid);
    }

    let source = match Destination::from_bytes(view.source_uid()) {
        Destination::Device(uid) => uid,
        _ => return Err(FrameError::SourceUidIsBroadcast),
    };

    Ok(RdmHeader {
        destination: Destination::from_bytes(view.destination_uid()),
        source,
        transaction_number: view.transaction_number().read(),
        port_id: view.port_id_response_type().read(),
        message_count: view.message_count().read(),
        sub_device: view.sub_device().read(),
        command_class: view.command_class().read(),
        parameter_id: view.parameter_id().read(),
        parameter_data_length: view.parameter_data_length().read(),
    })
}

/// The parameter-data slice of a validated frame.
pub fn parameter_data<'a>(frame: &'a [u8], header: &RdmHeader) -> &'a [u8] {
    &frame[RDM_HEADER_SIZE..RDM_HEADER_SIZE + header.parameter_data_length as usize]
}

/// The frame staging buffer, sized for the worst-case RDM frame.
pub struct FrameBuffer {
    data: [u8; RDM_MAX_FRAME_SIZE],
}

impl FrameBuffer {
    pub const fn new() -> Self {
        Self {
            data: [0u8; RDM_MAX_FRAME_SIZE],
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// A cursor over the parameter-data region, used by PID handlers to
    /// assemble reply payloads before the header is written.
    pub fn param_writer(&mut self) -> ParamWriter<'_> {
        ParamWriter {
            buffer: &mut self.data,
            cursor: RDM_HEADER_SIZE,
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Big-endian push cursor over a frame buffer's parameter-data region.
pub struct ParamWriter<'a> {
    buffer: &'a mut [u8; RDM_MAX_FRAME_SIZE],
    cursor: usize,
}

impl ParamWriter<'_> {
    const LIMIT: usize = RDM_MAX_FRAME_SIZE - RDM_CHECKSUM_LENGTH;

    pub fn push_u8(&mut self, value: u8) {
        self.push_slice(&[value]);
    }

    pub fn push_u16(&mut self, value: u16) {
        self.push_slice(&value.to_be_bytes());
    }

    pub fn push_u32(&mut self, value: u32) {
        self.push_slice(&value.to_be_bytes());
    }

    pub fn push_i16(&mut self, value: i16) {
        self.push_slice(&value.to_be_bytes());
    }

    pub fn push_slice(&mut self, bytes: &[u8]) {
        debug_assert!(self.cursor + bytes.len() <= Self::LIMIT);
        let available = Self::LIMIT - self.cursor;
        let take = bytes.len().min(available);
        self.buffer[self.cursor..self.cursor + take].copy_from_slice(&bytes[..take]);
        self.cursor += take;
    }

    /// Push up to `max_size` bytes of a label, stopping at the first NUL.
    /// Labels on the wire are unterminated and unpadded.
    pub fn push_str(&mut self, label: &str, max_size: usize) {
        let bytes = label.as_bytes();
        let end = bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(bytes.len())
            .min(max_size);
        self.push_slice(&bytes[..end]);
    }

    /// Header plus everything pushed so far.
    pub fn message_length(&self) -> usize {
        self.cursor
    }
}

/// Write the reply header in front of an assembled parameter payload and
/// append the checksum. `message_length` is the header plus the payload;
/// the return value is the full frame length, the responder's hand-off token.
pub fn finish_response(
    buffer: &mut FrameBuffer,
    request: &RdmHeader,
    source: Uid,
    response_type: ResponseType,
    response_class: ResponseCommandClass,
    message_count: u8,
    message_length: usize,
) -> i32 {
    let mut view = rdm_frame_layout::View::new(&mut buffer.data[..]);
    view.start_code_mut().write(SC_RDM);
    view.sub_start_code_mut().write(SC_SUB_MESSAGE);
    view.message_length_mut().write(message_length as u8);
    view.destination_uid_mut()
        .copy_from_slice(&request.source.to_bytes());
    view.source_uid_mut().copy_from_slice(&source.to_bytes());
    view.transaction_number_mut()
        .write(request.transaction_number);
    view.port_id_response_type_mut().write(response_type as u8);
    view.message_count_mut().write(message_count);
    view.sub_device_mut().write(request.sub_device);
    view.command_class_mut().write(response_class as u8);
    view.parameter_id_mut().write(request.parameter_id);
    view.parameter_data_length_mut()
        .write((message_length - RDM_HEADER_SIZE) as u8);

    append_checksum(&mut buffer.data, message_length) as i32
}

/// Encode a discovery-unique-branch response for `uid` into `out`.
///
/// No break precedes this on the wire: seven 0xFE preamble bytes, the 0xAA
/// delimiter, each uid byte expanded to `(b | 0xAA, b | 0x55)`, then the
/// checksum of the twelve expanded uid bytes expanded the same way.
pub fn encode_dub_response(uid: Uid, out: &mut [u8; DUB_RESPONSE_LENGTH]) {
    out[..PREAMBLE_LENGTH].fill(PREAMBLE_BYTE);
    out[PREAMBLE_LENGTH] = SEPARATOR_BYTE;

    let uid_bytes = uid.to_bytes();
    for (i, byte) in uid_bytes.iter().enumerate() {
        out[8 + 2 * i] = byte | 0xAA;
        out[8 + 2 * i + 1] = byte | 0x55;
    }

    let checksum = calculate_checksum(&out[8..20]);
    let [msb, lsb] = checksum.to_be_bytes();
    out[20] = msb | 0xAA;
    out[21] = msb | 0x55;
    out[22] = lsb | 0xAA;
    out[23] = lsb | 0x55;
}

/// Decode a captured DUB response window back into a uid.
///
/// Collisions corrupt the expanded bytes or the checksum, so any failure
/// here reads as "more than one responder answered".
pub fn decode_dub_response(window: &[u8]) -> Result<Uid, FrameError> {
    let separator = window
        .iter()
        .position(|&byte| byte == SEPARATOR_BYTE)
        .ok_or(FrameError::NotRdm)?;

    let encoded = &window[separator + 1..];
    if encoded.len() < 2 * UID_LENGTH + 4 {
        return Err(FrameError::ShortFrame);
    }

    let mut uid_bytes = [0u8; UID_LENGTH];
    for (i, pair) in encoded[..2 * UID_LENGTH].chunks_exact(2).enumerate() {
        uid_bytes[i] = pair[0] & pair[1];
    }

    let mut checksum_bytes = [0u8; 2];
    for (i, pair) in encoded[2 * UID_LENGTH..2 * UID_LENGTH + 4]
        .chunks_exact(2)
        .enumerate()
    {
        checksum_bytes[i] = pair[0] & pair[1];
    }

    if calculate_checksum(&encoded[..2 * UID_LENGTH]) != u16::from_be_bytes(checksum_bytes) {
        return Err(FrameError::ChecksumInvalid);
    }

    match Destination::from_bytes(&uid_bytes) {
        Destination::Device(uid) => Ok(uid),
        _ => Err(FrameError::SourceUidIsBroadcast),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_class::RequestCommandClass;
    use crate::pids;

    fn request_frame(
        destination: Destination,
        source: Uid,
        command_class: RequestCommandClass,
        pid: u16,
        param_data: &[u8],
    ) -> ([u8; RDM_MAX_FRAME_SIZE], usize) {
        let mut frame = [0u8; RDM_MAX_FRAME_SIZE];
        let message_length = RDM_HEADER_SIZE + param_data.len();
        {
            let mut view = rdm_frame_layout::View::new(&mut frame[..]);
            view.start_code_mut().write(SC_RDM);
            view.sub_start_code_mut().write(SC_SUB_MESSAGE);
            view.message_length_mut().write(message_length as u8);
            view.destination_uid_mut()
                .copy_from_slice(&destination.to_bytes());
            view.source_uid_mut().copy_from_slice(&source.to_bytes());
            view.transaction_number_mut().write(0x42);
            view.port_id_response_type_mut().write(0x01);
            view.message_count_mut().write(0);
            view.sub_device_mut().write(0);
            view.command_class_mut().write(command_class as u8);
            view.parameter_id_mut().write(pid);
            view.parameter_data_length_mut().write(param_data.len() as u8);
        }
        frame[RDM_HEADER_SIZE..message_length].copy_from_slice(param_data);
        let total = append_checksum(&mut frame, message_length);
        (frame, total)
    }

    #[test]
    fn validate_round_trips_a_request() {
        let source = Uid::new(0x0001, 1).unwrap();
        let dest = Uid::new(0x7A70, 1).unwrap();
        let (frame, total) = request_frame(
            Destination::Device(dest),
            source,
            RequestCommandClass::GetCommand,
            pids::DEVICE_INFO,
            &[],
        );

        let mut counters = ReceiverCounters::new();
        let header = validate(&frame[..total], &mut counters).unwrap();

        assert_eq!(header.destination, Destination::Device(dest));
        assert_eq!(header.source, source);
        assert_eq!(header.transaction_number, 0x42);
        assert_eq!(header.sub_device, 0);
        assert_eq!(header.command_class, RequestCommandClass::GetCommand as u8);
        assert_eq!(header.parameter_id, pids::DEVICE_INFO);
        assert_eq!(header.parameter_data_length, 0);
        assert_eq!(counters.rdm_short_frame(), 0);
        assert_eq!(counters.rdm_length_mismatch(), 0);
        assert_eq!(counters.rdm_checksum_invalid(), 0);
    }

    #[test]
    fn validate_counts_short_frames() {
        let mut counters = ReceiverCounters::new();
        assert_eq!(
            validate(&[SC_RDM, SC_SUB_MESSAGE, 24], &mut counters),
            Err(FrameError::ShortFrame)
        );
        assert_eq!(counters.rdm_short_frame(), 1);
    }

    #[test]
    fn validate_counts_length_mismatches() {
        let source = Uid::new(0x0001, 1).unwrap();
        let dest = Uid::new(0x7A70, 1).unwrap();
        let (mut frame, total) = request_frame(
            Destination::Device(dest),
            source,
            RequestCommandClass::GetCommand,
            pids::DEVICE_INFO,
            &[1, 2],
        );
        // Declared length now disagrees with the pdl.
        frame[2] = RDM_HEADER_SIZE as u8;

        let mut counters = ReceiverCounters::new();
        assert_eq!(
            validate(&frame[..total], &mut counters),
            Err(FrameError::LengthMismatch)
        );
        assert_eq!(counters.rdm_length_mismatch(), 1);
    }

    #[test]
    fn validate_counts_bad_checksums() {
        let source = Uid::new(0x0001, 1).unwrap();
        let dest = Uid::new(0x7A70, 1).unwrap();
        let (mut frame, total) = request_frame(
            Destination::Device(dest),
            source,
            RequestCommandClass::SetCommand,
            pids::IDENTIFY_DEVICE,
            &[1],
        );
        frame[total - 1] ^= 0xFF;

        let mut counters = ReceiverCounters::new();
        assert_eq!(
            validate(&frame[..total], &mut counters),
            Err(FrameError::ChecksumInvalid)
        );
        assert_eq!(counters.rdm_checksum_invalid(), 1);
    }

    #[test]
    fn validate_ignores_other_start_codes() {
        let mut counters = ReceiverCounters::new();
        let frame = [0u8; RDM_MIN_FRAME_SIZE];
        assert_eq!(validate(&frame, &mut counters), Err(FrameError::NotRdm));
        assert_eq!(counters.rdm_short_frame(), 0);
        assert_eq!(counters.rdm_length_mismatch(), 0);
        assert_eq!(counters.rdm_checksum_invalid(), 0);
    }

    #[test]
    fn checksum_is_additive_over_all_preceding_bytes() {
        assert_eq!(calculate_checksum(&[]), 0);
        assert_eq!(calculate_checksum(&[0x01, 0x02, 0x03]), 6);
        assert_eq!(calculate_checksum(&[0xFF; 600]), (600u32 * 255 % 65536) as u16);
    }

    #[test]
    fn finish_response_echoes_the_request_header() {
        let source = Uid::new(0x0001, 1).unwrap();
        let own = Uid::new(0x7A70, 1).unwrap();
        let (frame, total) = request_frame(
            Destination::Device(own),
            source,
            RequestCommandClass::GetCommand,
            pids::DMX_START_ADDRESS,
            &[],
        );
        let mut counters = ReceiverCounters::new();
        let request = validate(&frame[..total], &mut counters).unwrap();

        let mut buffer = FrameBuffer::new();
        let message_length = {
            let mut writer = buffer.param_writer();
            writer.push_u16(42);
            writer.message_length()
        };
        let reply_length = finish_response(
            &mut buffer,
            &request,
            own,
            ResponseType::Ack,
            ResponseCommandClass::GetCommandResponse,
            3,
            message_length,
        );
        assert_eq!(reply_length, (RDM_HEADER_SIZE + 2 + 2) as i32);

        let reply = validate(&buffer.as_slice()[..reply_length as usize], &mut counters).unwrap();
        assert_eq!(reply.destination, Destination::Device(source));
        assert_eq!(reply.source, own);
        assert_eq!(reply.transaction_number, request.transaction_number);
        assert_eq!(reply.sub_device, request.sub_device);
        assert_eq!(reply.port_id, ResponseType::Ack as u8);
        assert_eq!(reply.message_count, 3);
        assert_eq!(
            reply.command_class,
            ResponseCommandClass::GetCommandResponse as u8
        );
        assert_eq!(reply.parameter_id, pids::DMX_START_ADDRESS);
        assert_eq!(
            parameter_data(buffer.as_slice(), &reply),
            &42u16.to_be_bytes()
        );
    }

    #[test]
    fn param_writer_pushes_big_endian() {
        let mut buffer = FrameBuffer::new();
        let mut writer = buffer.param_writer();
        writer.push_u8(0x01);
        writer.push_u16(0x0203);
        writer.push_u32(0x0405_0607);
        writer.push_i16(-2);
        writer.push_str("abc\0def", 32);
        let length = writer.message_length();

        assert_eq!(length, RDM_HEADER_SIZE + 1 + 2 + 4 + 2 + 3);
        assert_eq!(
            &buffer.as_slice()[RDM_HEADER_SIZE..length],
            &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xFF, 0xFE, b'a', b'b', b'c']
        );
    }

    #[test]
    fn param_writer_truncates_long_labels() {
        let mut buffer = FrameBuffer::new();
        let mut writer = buffer.param_writer();
        writer.push_str("a very long device label that exceeds the field", 8);
        assert_eq!(writer.message_length(), RDM_HEADER_SIZE + 8);
    }

    #[test]
    fn dub_response_encoding_round_trips() {
        let uid = Uid::new(0x7A70, 0x0000_0001).unwrap();
        let mut response = [0u8; DUB_RESPONSE_LENGTH];
        encode_dub_response(uid, &mut response);

        assert_eq!(&response[..7], &[PREAMBLE_BYTE; 7]);
        assert_eq!(response[7], SEPARATOR_BYTE);
        assert_eq!(response[8], 0x7A | 0xAA);
        assert_eq!(response[9], 0x7A | 0x55);

        assert_eq!(decode_dub_response(&response), Ok(uid));
        // A leading glitch before the preamble must not confuse the decoder.
        let mut window = [0u8; DUB_RESPONSE_LENGTH + 2];
        window[2..].copy_from_slice(&response);
        window[0] = 0x00;
        window[1] = PREAMBLE_BYTE;
        assert_eq!(decode_dub_response(&window), Ok(uid));
    }

    #[test]
    fn dub_decode_detects_garbled_responses() {
        let uid = Uid::new(0x7A70, 0x0000_0001).unwrap();
        let mut response = [0u8; DUB_RESPONSE_LENGTH];
        encode_dub_response(uid, &mut response);

        // A second responder driving the line high garbles an encoded byte;
        // the checksum no longer agrees with the decoded uid.
        response[9] = 0xFF;
        assert_eq!(
            decode_dub_response(&response),
            Err(FrameError::ChecksumInvalid)
        );
    }
}
