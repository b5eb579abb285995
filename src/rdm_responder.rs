//! The RDM responder model: a declarative responder definition, the mutable
//! per-responder state, and PID dispatch.
//!
//! A responder is described by a static [ResponderDefinition] (descriptor
//! table, personalities, sensors, labels) and carries its mutable state in an
//! [RdmResponder]. Dispatch takes an explicit responder handle, so root and
//! sub-device responders are just different objects handed to
//! [RdmResponder::handle_frame]; nothing is global.
//!
//! PID handlers follow the firmware convention: they assemble the reply into
//! the context's frame buffer and return its length. Positive means "send
//! with a break", zero means silence, and a negative length is a raw
//! discovery response sent without a break.

use log::warn;

use crate::coarse_timer::{ticks_from_millis, CoarseTimer, TimerValue};
use crate::command_class::RequestCommandClass;
use crate::consts::{
    ALL_SENSORS, DUB_RESPONSE_LENGTH, INVALID_DMX_START_ADDRESS, MAX_DEFAULT_SLOT_VALUE_PER_FRAME,
    MAX_DMX_START_ADDRESS, MAX_PRODUCT_DETAILS, MAX_SENSOR_COUNT, MAX_SLOT_INFO_PER_FRAME,
    RDM_DEFAULT_STRING_SIZE, RDM_HEADER_SIZE, RDM_PROTOCOL_VERSION, SC_RDM,
    SENSOR_VALUE_UNSUPPORTED, SUB_DEVICE_ROOT, UID_LENGTH,
};
use crate::hal::StatusLamps;
use crate::layouts::{device_info_layout, sensor_value_layout};
use crate::pids;
use crate::rdm_frame::{self, FrameBuffer, RdmHeader};
use crate::receiver_counters::ReceiverCounters;
use crate::types::{MuteControlField, NackReason, ResponseType};
use crate::unique_identifier::Uid;

/// Handler return value when no reply goes on the wire.
pub const NO_RESPONSE: i32 = 0;

const BOOT_SOFTWARE_VERSION: u32 = 0x0000_0001;
const BOOT_SOFTWARE_LABEL: &str = "0.1.0";

/// Identify lamp toggle period: 1.0s.
const FLASH_FAST: u32 = ticks_from_millis(1_000);
/// Mute lamp toggle period: 10.0s.
const FLASH_SLOW: u32 = ticks_from_millis(10_000);

/// Sensor definitions set bit 0 when SENSOR_VALUE snapshots are recordable
/// and bit 1 when lowest/highest tracking is supported.
pub const SENSOR_SUPPORTS_RECORDING: u8 = 0x01;
pub const SENSOR_SUPPORTS_LOWEST_HIGHEST: u8 = 0x02;

/// Everything a dispatch cycle may touch besides the responder itself.
pub struct DispatchContext<'a> {
    pub clock: &'a CoarseTimer,
    pub counters: &'a mut ReceiverCounters,
    pub lamps: &'a mut dyn StatusLamps,
    /// The staging buffer replies are assembled into. The responder owns it
    /// for the duration of the dispatch; the returned length hands it back.
    pub reply: &'a mut FrameBuffer,
}

/// A PID handler; returns the reply length per the module convention.
pub type PidHandler = fn(&mut RdmResponder, &mut DispatchContext<'_>, &RdmHeader, &[u8]) -> i32;

/// One row of the dispatch table.
pub struct PidDescriptor {
    pub pid: u16,
    /// Handler for GET requests; `None` NACKs with unsupported command
    /// class.
    pub get_handler: Option<PidHandler>,
    /// The exact parameter data length a GET must carry.
    pub get_param_size: u8,
    /// Handler for SET requests; `None` NACKs with unsupported command
    /// class. SET handlers validate their own parameter data.
    pub set_handler: Option<PidHandler>,
}

pub struct SlotDefinition {
    pub description: &'static str,
    pub slot_label_id: u16,
    pub slot_type: u8,
    pub default_value: u8,
}

pub struct PersonalityDefinition {
    /// Slots this personality occupies, 0..=512.
    pub dmx_footprint: u16,
    pub description: &'static str,
    /// May be empty when slot definitions aren't provided.
    pub slots: &'static [SlotDefinition],
}

pub struct SensorDefinition {
    pub description: &'static str,
    pub range_minimum_value: i16,
    pub range_maximum_value: i16,
    pub normal_minimum_value: i16,
    pub normal_maximum_value: i16,
    pub recorded_value_support: u8,
    pub sensor_type: u8,
    pub unit: u8,
    pub prefix: u8,
}

/// The live values behind one sensor.
#[derive(Copy, Clone)]
pub struct SensorData {
    pub present_value: i16,
    pub lowest_value: i16,
    pub highest_value: i16,
    pub recorded_value: i16,
    /// When set, SENSOR_VALUE GETs NACK with `nack_reason` (used while a
    /// sensor is faulted).
    pub should_nack: bool,
    pub nack_reason: NackReason,
}

impl Default for SensorData {
    fn default() -> Self {
        Self {
            present_value: 0,
            lowest_value: SENSOR_VALUE_UNSUPPORTED,
            highest_value: SENSOR_VALUE_UNSUPPORTED,
            recorded_value: SENSOR_VALUE_UNSUPPORTED,
            should_nack: false,
            nack_reason: NackReason::HardwareFault,
        }
    }
}

/// The static description of a responder: dispatch table and const data.
pub struct ResponderDefinition {
    pub descriptors: &'static [PidDescriptor],
    pub sensors: &'static [SensorDefinition],
    pub personalities: &'static [PersonalityDefinition],
    pub software_version_label: &'static str,
    pub manufacturer_label: &'static str,
    pub model_description: &'static str,
    pub default_device_label: &'static str,
    pub product_detail_ids: &'static [u16],
    pub software_version: u32,
    pub model_id: u16,
    pub product_category: u16,
}

/// What the dispatch produced, from the transceiver's point of view.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DispatchOutcome {
    NoResponse,
    /// Reply of this length is staged in the buffer; send with a break.
    Reply(usize),
    /// Raw discovery response of this length; send without a break.
    DubReply(usize),
}

/// The mutable state of one logical responder (root or sub-device).
pub struct RdmResponder {
    uid: Uid,
    def: &'static ResponderDefinition,
    pub device_label: heapless::Vec<u8, RDM_DEFAULT_STRING_SIZE>,
    sensors: heapless::Vec<SensorData, MAX_SENSOR_COUNT>,
    pub dmx_start_address: u16,
    pub sub_device_count: u16,
    /// 1-based, always <= the personality count when personalities exist.
    pub current_personality: u8,
    pub queued_message_count: u8,
    pub is_muted: bool,
    pub identify_on: bool,
    pub using_factory_defaults: bool,
    pub is_subdevice: bool,
    pub is_managed_proxy: bool,
    pub is_proxied_device: bool,
    identify_timer: TimerValue,
    mute_timer: TimerValue,
}

impl RdmResponder {
    pub fn new(uid: Uid, def: &'static ResponderDefinition, clock: &CoarseTimer) -> Self {
        if def.sensors.len() > MAX_SENSOR_COUNT {
            warn!("sensor table truncated to {}", MAX_SENSOR_COUNT);
        }
        let mut responder = Self {
            uid,
            def,
            device_label: heapless::Vec::new(),
            sensors: heapless::Vec::new(),
            dmx_start_address: INVALID_DMX_START_ADDRESS,
            sub_device_count: 0,
            current_personality: 1,
            queued_message_count: 0,
            is_muted: false,
            identify_on: false,
            using_factory_defaults: true,
            is_subdevice: false,
            is_managed_proxy: false,
            is_proxied_device: false,
            identify_timer: 0,
            mute_timer: clock.now(),
        };
        for _ in def.sensors.iter().take(MAX_SENSOR_COUNT) {
            let _ = responder.sensors.push(SensorData::default());
        }
        responder.reset_to_factory_defaults();
        responder
    }

    pub fn uid(&self) -> Uid {
        self.uid
    }

    pub fn definition(&self) -> &'static ResponderDefinition {
        self.def
    }

    /// Restore every mutable field to its factory state.
    pub fn reset_to_factory_defaults(&mut self) {
        self.dmx_start_address = INVALID_DMX_START_ADDRESS;
        self.sub_device_count = 0;
        self.current_personality = 1;
        self.queued_message_count = 0;
        self.is_muted = false;
        self.identify_on = false;

        self.device_label.clear();
        let label = self.def.default_device_label.as_bytes();
        let _ = self
            .device_label
            .extend_from_slice(&label[..label.len().min(RDM_DEFAULT_STRING_SIZE)]);

        if !self.def.personalities.is_empty() {
            self.current_personality = 1;
            self.dmx_start_address = 1;
        }

        for index in 0..self.sensors.len() {
            self.reset_sensor(index);
        }

        self.using_factory_defaults = true;
    }

    /// Periodic lamp cadence: identify flashes at 1Hz while on; the mute
    /// lamp blinks slowly while unmuted and stays dark while muted.
    pub fn tasks(&mut self, clock: &CoarseTimer, lamps: &mut dyn StatusLamps) {
        if self.identify_on && clock.has_elapsed(self.identify_timer, FLASH_FAST) {
            self.identify_timer = clock.now();
            lamps.toggle_identify_lamp();
        }

        if !self.is_muted && clock.has_elapsed(self.mute_timer, FLASH_SLOW) {
            self.mute_timer = clock.now();
            lamps.toggle_mute_lamp();
        }
    }

    /// Feed a received frame through validation and dispatch.
    pub fn handle_frame(&mut self, frame: &[u8], ctx: &mut DispatchContext<'_>) -> DispatchOutcome {
        let Some(&start_code) = frame.first() else {
            return DispatchOutcome::NoResponse;
        };

        if start_code != SC_RDM {
            ctx.counters.count_dmx_frame();
            return DispatchOutcome::NoResponse;
        }

        ctx.counters.count_rdm_frame();
        let header = match rdm_frame::validate(frame, ctx.counters) {
            Ok(header) => header,
            Err(_) => return DispatchOutcome::NoResponse,
        };
        let param_data = rdm_frame::parameter_data(frame, &header);

        let result = self.handle_rdm(ctx, &header, param_data);
        if result > 0 {
            DispatchOutcome::Reply(result as usize)
        } else if result < 0 {
            DispatchOutcome::DubReply(-result as usize)
        } else {
            DispatchOutcome::NoResponse
        }
    }

    /// Dispatch a validated request against this responder.
    pub fn handle_rdm(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        param_data: &[u8],
    ) -> i32 {
        if !header.destination.addresses(self.uid) {
            return NO_RESPONSE;
        }

        let Ok(command_class) = RequestCommandClass::try_from(header.command_class) else {
            return NO_RESPONSE;
        };

        if command_class == RequestCommandClass::DiscoveryCommand {
            return self.handle_discovery(ctx, header, param_data);
        }

        // Administrative PIDs never address sub-devices, and a NACK is not
        // possible for them (section 6.3 of E1.20), so the request drops
        // silently.
        if header.sub_device != SUB_DEVICE_ROOT && is_root_only_pid(header.parameter_id) {
            return NO_RESPONSE;
        }

        self.dispatch_pid(ctx, header, param_data, command_class)
    }

    fn dispatch_pid(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        param_data: &[u8],
        command_class: RequestCommandClass,
    ) -> i32 {
        let descriptor = self
            .def
            .descriptors
            .iter()
            .find(|descriptor| descriptor.pid == header.parameter_id);
        let Some(descriptor) = descriptor else {
            return self.nack(ctx, header, NackReason::UnknownPid);
        };

        match command_class {
            RequestCommandClass::GetCommand => {
                if !header.destination.is_unicast() {
                    return NO_RESPONSE;
                }
                let Some(handler) = descriptor.get_handler else {
                    return self.nack(ctx, header, NackReason::UnsupportedCommandClass);
                };
                if header.parameter_data_length != descriptor.get_param_size {
                    return self.nack(ctx, header, NackReason::FormatError);
                }
                handler(self, ctx, header, param_data)
            }
            RequestCommandClass::SetCommand => match descriptor.set_handler {
                Some(handler) => handler(self, ctx, header, param_data),
                None => self.nack(ctx, header, NackReason::UnsupportedCommandClass),
            },
            RequestCommandClass::DiscoveryCommand => {
                self.nack(ctx, header, NackReason::UnsupportedCommandClass)
            }
        }
    }

    /// DISC_UNIQUE_BRANCH / DISC_MUTE / DISC_UN_MUTE.
    pub fn handle_discovery(
        &mut self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        param_data: &[u8],
    ) -> i32 {
        if header.sub_device != SUB_DEVICE_ROOT {
            return NO_RESPONSE;
        }

        match header.parameter_id {
            pids::DISC_UNIQUE_BRANCH => self.handle_dub(ctx, param_data),
            pids::DISC_MUTE => self.set_mute(ctx, header),
            pids::DISC_UN_MUTE => self.set_un_mute(ctx, header),
            _ => NO_RESPONSE,
        }
    }

    /// Stage the raw DUB response if our uid falls inside the branch.
    pub fn handle_dub(&mut self, ctx: &mut DispatchContext<'_>, param_data: &[u8]) -> i32 {
        if self.is_muted || param_data.len() != 2 * UID_LENGTH {
            return NO_RESPONSE;
        }

        let own = self.uid.to_bytes();
        let lower = &param_data[..UID_LENGTH];
        let upper = &param_data[UID_LENGTH..];
        if !(lower <= &own[..] && &own[..] <= upper) {
            return NO_RESPONSE;
        }

        let out: &mut [u8; DUB_RESPONSE_LENGTH] = (&mut ctx.reply.as_mut_slice()
            [..DUB_RESPONSE_LENGTH])
            .try_into()
            .unwrap();
        rdm_frame::encode_dub_response(self.uid, out);
        -(DUB_RESPONSE_LENGTH as i32)
    }

    fn set_mute(&mut self, ctx: &mut DispatchContext<'_>, header: &RdmHeader) -> i32 {
        if header.parameter_data_length != 0 {
            return NO_RESPONSE;
        }
        self.is_muted = true;
        ctx.lamps.set_mute_lamp(false);

        if !header.destination.is_unicast() {
            return NO_RESPONSE;
        }
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u16(self.control_field());
            writer.message_length()
        };
        self.finish(ctx, header, ResponseType::Ack, message_length)
    }

    fn set_un_mute(&mut self, ctx: &mut DispatchContext<'_>, header: &RdmHeader) -> i32 {
        if header.parameter_data_length != 0 {
            return NO_RESPONSE;
        }
        self.is_muted = false;
        ctx.lamps.set_mute_lamp(true);
        self.mute_timer = ctx.clock.now();

        if !header.destination.is_unicast() {
            return NO_RESPONSE;
        }
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u16(self.control_field());
            writer.message_length()
        };
        self.finish(ctx, header, ResponseType::Ack, message_length)
    }

    fn control_field(&self) -> u16 {
        MuteControlField::new()
            .with_has_sub_devices(self.sub_device_count > 0)
            .with_managed_proxy(self.is_managed_proxy)
            .with_proxied_device(self.is_proxied_device)
            .to_wire()
    }

    // Reply builders.
    // ------------------------------------------------------------------

    fn finish(
        &self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        response_type: ResponseType,
        message_length: usize,
    ) -> i32 {
        let Ok(request_class) = RequestCommandClass::try_from(header.command_class) else {
            return NO_RESPONSE;
        };
        rdm_frame::finish_response(
            ctx.reply,
            header,
            self.uid,
            response_type,
            request_class.response_class(),
            self.queued_message_count,
            message_length,
        )
    }

    /// ACK whose parameter data is already in the buffer.
    pub fn ack(
        &self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        message_length: usize,
    ) -> i32 {
        self.finish(ctx, header, ResponseType::Ack, message_length)
    }

    /// Empty ACK for a SET, suppressed for non-unicast requests.
    pub fn set_ack(&self, ctx: &mut DispatchContext<'_>, header: &RdmHeader) -> i32 {
        if !header.destination.is_unicast() {
            return NO_RESPONSE;
        }
        self.finish(ctx, header, ResponseType::Ack, RDM_HEADER_SIZE)
    }

    /// NACK with a reason, suppressed for non-unicast requests.
    pub fn nack(
        &self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        reason: NackReason,
    ) -> i32 {
        if !header.destination.is_unicast() {
            return NO_RESPONSE;
        }
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u16(reason as u16);
            writer.message_length()
        };
        self.finish(ctx, header, ResponseType::NackReason, message_length)
    }

    /// ACK_TIMER: the reply will be queued, ready in `delay` tenths of a
    /// second.
    pub fn ack_timer(&self, ctx: &mut DispatchContext<'_>, header: &RdmHeader, delay: u16) -> i32 {
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u16(delay);
            writer.message_length()
        };
        self.finish(ctx, header, ResponseType::AckTimer, message_length)
    }

    /// ACK carrying a label.
    pub fn reply_string(
        &self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        value: &str,
    ) -> i32 {
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_str(value, RDM_DEFAULT_STRING_SIZE);
            writer.message_length()
        };
        self.ack(ctx, header, message_length)
    }

    /// ACK carrying a single boolean byte.
    pub fn reply_bool(
        &self,
        ctx: &mut DispatchContext<'_>,
        header: &RdmHeader,
        value: bool,
    ) -> i32 {
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u8(value as u8);
            writer.message_length()
        };
        self.ack(ctx, header, message_length)
    }

    /// ACK carrying one big-endian u16.
    pub fn reply_u16(&self, ctx: &mut DispatchContext<'_>, header: &RdmHeader, value: u16) -> i32 {
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u16(value);
            writer.message_length()
        };
        self.ack(ctx, header, message_length)
    }

    /// ACK carrying one big-endian u32.
    pub fn reply_u32(&self, ctx: &mut DispatchContext<'_>, header: &RdmHeader, value: u32) -> i32 {
        let message_length = {
            let mut writer = ctx.reply.param_writer();
            writer.push_u32(value);
            writer.message_length()
        };
        self.ack(ctx, header, message_length)
    }

    // Sensor plumbing.
    // ------------------------------------------------------------------

    /// Update a sensor reading, maintaining lowest/highest tracking when the
    /// definition supports it.
    pub fn set_sensor_value(&mut self, index: usize, value: i16) {
        let Some(definition) = self.def.sensors.get(index) else {
            return;
        };
        let Some(data) = self.sensors.get_mut(index) else {
            return;
        };
        data.present_value = value;
        if definition.recorded_value_support & SENSOR_SUPPORTS_LOWEST_HIGHEST != 0 {
            data.lowest_value = data.lowest_value.min(value);
            data.highest_value = data.highest_value.max(value);
        }
    }

    pub fn sensor_data(&self, index: usize) -> Option<&SensorData> {
        self.sensors.get(index)
    }

    pub fn sensor_data_mut(&mut self, index: usize) -> Option<&mut SensorData> {
        self.sensors.get_mut(index)
    }

    fn record_sensor(&mut self, index: usize) {
        if self.def.sensors[index].recorded_value_support & SENSOR_SUPPORTS_RECORDING != 0 {
            let data = &mut self.sensors[index];
            data.recorded_value = data.present_value;
        }
    }

    fn reset_sensor(&mut self, index: usize) {
        let support = self.def.sensors[index].recorded_value_support;
        let data = &mut self.sensors[index];

        if support & SENSOR_SUPPORTS_LOWEST_HIGHEST != 0 {
            data.lowest_value = data.present_value;
            data.highest_value = data.present_value;
        } else {
            data.lowest_value = SENSOR_VALUE_UNSUPPORTED;
            data.highest_value = SENSOR_VALUE_UNSUPPORTED;
        }

        if support & SENSOR_SUPPORTS_RECORDING != 0 {
            data.recorded_value = data.present_value;
        } else {
            data.recorded_value = SENSOR_VALUE_UNSUPPORTED;
        }
    }

    fn current_personality_def(&self) -> Option<&'static PersonalityDefinition> {
        self.def
            .personalities
            .get(self.current_personality as usize - 1)
    }
}

fn is_root_only_pid(pid: u16) -> bool {
    matches!(
        pid,
        pids::DISC_UNIQUE_BRANCH
            | pids::DISC_MUTE
            | pids::DISC_UN_MUTE
            | pids::SUPPORTED_PARAMETERS
            | pids::PARAMETER_DESCRIPTION
            | pids::DEVICE_INFO
            | pids::SOFTWARE_VERSION_LABEL
            | pids::DMX_START_ADDRESS
            | pids::IDENTIFY_DEVICE
    )
}

/// PIDs that must not appear in a root responder's SUPPORTED_PARAMETERS
/// reply (table 10-1 marks them required).
fn is_required_pid(pid: u16) -> bool {
    is_root_only_pid(pid)
}

// PID handlers.
// ----------------------------------------------------------------------------

fn push_sensor_value_body(writer: &mut rdm_frame::ParamWriter<'_>, index: u8, data: &SensorData) {
    let mut body = [0u8; 9];
    {
        let mut view = sensor_value_layout::View::new(&mut body[..]);
        view.sensor_index_mut().write(index);
        view.present_value_mut().write(data.present_value);
        view.lowest_value_mut().write(data.lowest_value);
        view.highest_value_mut().write(data.highest_value);
        view.recorded_value_mut().write(data.recorded_value);
    }
    writer.push_slice(&body);
}

pub fn get_supported_parameters(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let is_subdevice = responder.is_subdevice;
    let message_length = {
        let mut writer = ctx.reply.param_writer();
        for descriptor in responder.def.descriptors {
            if is_required_pid(descriptor.pid) {
                // Required PIDs are implied for the root but spelled out for
                // sub-devices.
                if is_subdevice {
                    writer.push_u16(descriptor.pid);
                }
            } else {
                writer.push_u16(descriptor.pid);
            }
        }
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_comms_status(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let message_length = {
        let short = ctx.counters.rdm_short_frame();
        let mismatch = ctx.counters.rdm_length_mismatch();
        let checksum = ctx.counters.rdm_checksum_invalid();
        let mut writer = ctx.reply.param_writer();
        writer.push_u16(short);
        writer.push_u16(mismatch);
        writer.push_u16(checksum);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn set_comms_status(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    if header.parameter_data_length != 0 {
        return responder.nack(ctx, header, NackReason::FormatError);
    }
    ctx.counters.reset_comms_status();
    responder.set_ack(ctx, header)
}

pub fn get_device_info(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let footprint = responder
        .current_personality_def()
        .map(|personality| personality.dmx_footprint)
        .unwrap_or(0);
    let personality_count = responder.def.personalities.len().max(1) as u8;

    let mut body = [0u8; 19];
    {
        let mut view = device_info_layout::View::new(&mut body[..]);
        view.protocol_version_mut().write(RDM_PROTOCOL_VERSION);
        view.device_model_id_mut().write(responder.def.model_id);
        view.product_category_mut()
            .write(responder.def.product_category);
        view.software_version_id_mut()
            .write(responder.def.software_version);
        view.dmx_footprint_mut().write(footprint);
        view.current_personality_mut()
            .write(responder.current_personality);
        view.personality_count_mut().write(personality_count);
        view.dmx_start_address_mut()
            .write(responder.dmx_start_address);
        view.sub_device_count_mut().write(responder.sub_device_count);
        view.sensor_count_mut().write(responder.sensors.len() as u8);
    }

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        writer.push_slice(&body);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_product_detail_ids(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let message_length = {
        let mut writer = ctx.reply.param_writer();
        for detail in responder
            .def
            .product_detail_ids
            .iter()
            .take(MAX_PRODUCT_DETAILS)
        {
            writer.push_u16(*detail);
        }
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_device_model_description(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_string(ctx, header, responder.def.model_description)
}

pub fn get_manufacturer_label(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_string(ctx, header, responder.def.manufacturer_label)
}

pub fn get_software_version_label(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_string(ctx, header, responder.def.software_version_label)
}

pub fn get_boot_software_version(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_u32(ctx, header, BOOT_SOFTWARE_VERSION)
}

pub fn get_boot_software_version_label(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_string(ctx, header, BOOT_SOFTWARE_LABEL)
}

pub fn get_device_label(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let message_length = {
        let label = responder.device_label.clone();
        let mut writer = ctx.reply.param_writer();
        writer.push_slice(&label);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn set_device_label(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    if param_data.len() > RDM_DEFAULT_STRING_SIZE {
        return responder.nack(ctx, header, NackReason::FormatError);
    }
    let end = param_data
        .iter()
        .position(|&byte| byte == 0)
        .unwrap_or(param_data.len());
    responder.device_label.clear();
    let _ = responder.device_label.extend_from_slice(&param_data[..end]);
    responder.using_factory_defaults = false;
    responder.set_ack(ctx, header)
}

pub fn get_dmx_personality(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let message_length = {
        let mut writer = ctx.reply.param_writer();
        writer.push_u8(responder.current_personality);
        writer.push_u8(responder.def.personalities.len() as u8);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn set_dmx_personality(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    if param_data.len() != 1 {
        return responder.nack(ctx, header, NackReason::FormatError);
    }
    let new_personality = param_data[0];
    if new_personality == 0 || new_personality as usize > responder.def.personalities.len() {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    }
    if responder.current_personality != new_personality {
        responder.using_factory_defaults = false;
    }
    responder.current_personality = new_personality;
    responder.set_ack(ctx, header)
}

pub fn get_dmx_personality_description(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    let index = param_data[0];
    if index == 0 || index as usize > responder.def.personalities.len() {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    }
    let personality = &responder.def.personalities[index as usize - 1];

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        writer.push_u8(index);
        writer.push_u16(personality.dmx_footprint);
        writer.push_str(personality.description, RDM_DEFAULT_STRING_SIZE);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_dmx_start_address(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_u16(ctx, header, responder.dmx_start_address)
}

pub fn set_dmx_start_address(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    if param_data.len() != 2 {
        return responder.nack(ctx, header, NackReason::FormatError);
    }
    let address = u16::from_be_bytes([param_data[0], param_data[1]]);
    if address == 0 || address > MAX_DMX_START_ADDRESS {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    }
    if responder.dmx_start_address != address {
        responder.using_factory_defaults = false;
    }
    responder.dmx_start_address = address;
    responder.set_ack(ctx, header)
}

pub fn get_slot_info(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let Some(personality) = responder.current_personality_def() else {
        return responder.nack(ctx, header, NackReason::HardwareFault);
    };
    if personality.slots.is_empty() {
        return responder.nack(ctx, header, NackReason::HardwareFault);
    }

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        for (index, slot) in personality
            .slots
            .iter()
            .take(MAX_SLOT_INFO_PER_FRAME)
            .enumerate()
        {
            writer.push_u16(index as u16);
            writer.push_u8(slot.slot_type);
            writer.push_u16(slot.slot_label_id);
        }
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_slot_description(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    let slot_index = u16::from_be_bytes([param_data[0], param_data[1]]);

    let Some(personality) = responder.current_personality_def() else {
        return responder.nack(ctx, header, NackReason::HardwareFault);
    };
    if personality.slots.is_empty() {
        return responder.nack(ctx, header, NackReason::HardwareFault);
    }
    if slot_index as usize >= personality.slots.len() {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    }

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        writer.push_u16(slot_index);
        writer.push_str(
            personality.slots[slot_index as usize].description,
            RDM_DEFAULT_STRING_SIZE,
        );
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_default_slot_value(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    let Some(personality) = responder.current_personality_def() else {
        return responder.nack(ctx, header, NackReason::HardwareFault);
    };
    if personality.slots.is_empty() {
        return responder.nack(ctx, header, NackReason::HardwareFault);
    }

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        for (index, slot) in personality
            .slots
            .iter()
            .take(MAX_DEFAULT_SLOT_VALUE_PER_FRAME)
            .enumerate()
        {
            writer.push_u16(index as u16);
            writer.push_u8(slot.default_value);
        }
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_sensor_definition(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    let index = param_data[0];
    let Some(sensor) = responder.def.sensors.get(index as usize) else {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    };

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        writer.push_u8(index);
        writer.push_u8(sensor.sensor_type);
        writer.push_u8(sensor.unit);
        writer.push_u8(sensor.prefix);
        writer.push_i16(sensor.range_minimum_value);
        writer.push_i16(sensor.range_maximum_value);
        writer.push_i16(sensor.normal_minimum_value);
        writer.push_i16(sensor.normal_maximum_value);
        writer.push_u8(sensor.recorded_value_support);
        writer.push_str(sensor.description, RDM_DEFAULT_STRING_SIZE);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn get_sensor_value(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    let index = param_data[0];
    let Some(data) = responder.sensor_data(index as usize).copied() else {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    };

    if data.should_nack {
        return responder.nack(ctx, header, data.nack_reason);
    }

    let message_length = {
        let mut writer = ctx.reply.param_writer();
        push_sensor_value_body(&mut writer, index, &data);
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn set_sensor_value(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    if param_data.len() != 1 {
        return responder.nack(ctx, header, NackReason::FormatError);
    }

    let index = param_data[0];
    if (index as usize) < responder.sensors.len() {
        responder.reset_sensor(index as usize);
    } else if index == ALL_SENSORS {
        for sensor_index in 0..responder.sensors.len() {
            responder.reset_sensor(sensor_index);
        }
    } else {
        return responder.nack(ctx, header, NackReason::DataOutOfRange);
    }

    if !header.destination.is_unicast() {
        return NO_RESPONSE;
    }

    let message_length = {
        let data = if index == ALL_SENSORS {
            None
        } else {
            Some(responder.sensors[index as usize])
        };
        let mut writer = ctx.reply.param_writer();
        match data {
            Some(data) => push_sensor_value_body(&mut writer, index, &data),
            None => writer.push_slice(&[0u8; 9]),
        }
        writer.message_length()
    };
    responder.ack(ctx, header, message_length)
}

pub fn set_record_sensors(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    if param_data.len() != 1 {
        return responder.nack(ctx, header, NackReason::FormatError);
    }

    let index = param_data[0];
    if (index as usize) < responder.sensors.len() {
        if responder.def.sensors[index as usize].recorded_value_support & SENSOR_SUPPORTS_RECORDING
            != 0
        {
            responder.record_sensor(index as usize);
            responder.set_ack(ctx, header)
        } else {
            responder.nack(ctx, header, NackReason::DataOutOfRange)
        }
    } else if index == ALL_SENSORS {
        for sensor_index in 0..responder.sensors.len() {
            responder.record_sensor(sensor_index);
        }
        responder.set_ack(ctx, header)
    } else {
        responder.nack(ctx, header, NackReason::DataOutOfRange)
    }
}

pub fn get_identify_device(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    _param_data: &[u8],
) -> i32 {
    responder.reply_bool(ctx, header, responder.identify_on)
}

pub fn set_identify_device(
    responder: &mut RdmResponder,
    ctx: &mut DispatchContext<'_>,
    header: &RdmHeader,
    param_data: &[u8],
) -> i32 {
    if param_data.len() != 1 {
        return responder.nack(ctx, header, NackReason::FormatError);
    }
    let requested = match param_data[0] {
        0 => false,
        1 => true,
        _ => return responder.nack(ctx, header, NackReason::DataOutOfRange),
    };

    let previous = responder.identify_on;
    responder.identify_on = requested;
    let result = responder.set_ack(ctx, header);

    if requested != previous {
        responder.using_factory_defaults = false;
        if requested {
            responder.identify_timer = ctx.clock.now();
            ctx.lamps.set_identify_lamp(true);
        } else {
            ctx.lamps.set_identify_lamp(false);
        }
    }
    result
}

/// The dispatch table covering the PIDs every responder built on this crate
/// supports. Discovery PIDs route through [RdmResponder::handle_discovery]
/// and are deliberately absent.
pub const CORE_DESCRIPTORS: &[PidDescriptor] = &[
    PidDescriptor {
        pid: pids::COMMS_STATUS,
        get_handler: Some(get_comms_status),
        get_param_size: 0,
        set_handler: Some(set_comms_status),
    },
    PidDescriptor {
        pid: pids::SUPPORTED_PARAMETERS,
        get_handler: Some(get_supported_parameters),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::DEVICE_INFO,
        get_handler: Some(get_device_info),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::PRODUCT_DETAIL_ID_LIST,
        get_handler: Some(get_product_detail_ids),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::DEVICE_MODEL_DESCRIPTION,
        get_handler: Some(get_device_model_description),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::MANUFACTURER_LABEL,
        get_handler: Some(get_manufacturer_label),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::DEVICE_LABEL,
        get_handler: Some(get_device_label),
        get_param_size: 0,
        set_handler: Some(set_device_label),
    },
    PidDescriptor {
        pid: pids::SOFTWARE_VERSION_LABEL,
        get_handler: Some(get_software_version_label),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::BOOT_SOFTWARE_VERSION_ID,
        get_handler: Some(get_boot_software_version),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::BOOT_SOFTWARE_VERSION_LABEL,
        get_handler: Some(get_boot_software_version_label),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::DMX_PERSONALITY,
        get_handler: Some(get_dmx_personality),
        get_param_size: 0,
        set_handler: Some(set_dmx_personality),
    },
    PidDescriptor {
        pid: pids::DMX_PERSONALITY_DESCRIPTION,
        get_handler: Some(get_dmx_personality_description),
        get_param_size: 1,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::DMX_START_ADDRESS,
        get_handler: Some(get_dmx_start_address),
        get_param_size: 0,
        set_handler: Some(set_dmx_start_address),
    },
    PidDescriptor {
        pid: pids::SLOT_INFO,
        get_handler: Some(get_slot_info),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::SLOT_DESCRIPTION,
        get_handler: Some(get_slot_description),
        get_param_size: 2,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::DEFAULT_SLOT_VALUE,
        get_handler: Some(get_default_slot_value),
        get_param_size: 0,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::SENSOR_DEFINITION,
        get_handler: Some(get_sensor_definition),
        get_param_size: 1,
        set_handler: None,
    },
    PidDescriptor {
        pid: pids::SENSOR_VALUE,
        get_handler: Some(get_sensor_value),
        get_param_size: 1,
        set_handler: Some(set_sensor_value),
    },
    PidDescriptor {
        pid: pids::RECORD_SENSORS,
        get_handler: None,
        get_param_size: 0,
        set_handler: Some(set_record_sensors),
    },
    PidDescriptor {
        pid: pids::IDENTIFY_DEVICE,
        get_handler: Some(get_identify_device),
        get_param_size: 0,
        set_handler: Some(set_identify_device),
    },
];
