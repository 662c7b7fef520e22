//! Firmware control channel
//!
//! Frames a request, digests it with MD5, hands it to
//! [`Driver::fw_control`] and validates the response:
//!
//! ```text
//! digest ─▶ header length ─▶ opcode/sequence echo ─▶ major status
//! ```
//!
//! A digest mismatch is [`VdmaError::DigestMismatch`], a short or mismatched
//! header is `Malformed`, a firmware-reported failure is `FirmwareControl`.
//! On top of the framing sit the context-switch RPCs the resources manager
//! uses.

// Control payload fields are u8/u16 on the wire
#![allow(clippy::cast_possible_truncation)]

use crate::driver::{Driver, FwControlResponse};
use crate::error::{Result, VdmaError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hailo_chip::action::MAX_ACTION_LIST_SIZE;
use hailo_chip::context::ContextKind;
use hailo_chip::control::{
    opcode, CpuId, DEFAULT_CONTROL_TIMEOUT_MS, HEADER_SIZE, MAX_CONTROL_LENGTH, PROTOCOL_VERSION,
    STATUS_SUCCESS,
};
use md5::{Digest, Md5};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed part of a `SET_CONTEXT_INFO` payload
const CONTEXT_INFO_HEADER_SIZE: usize = 6;

/// Fixed part of a `DOWNLOAD_CONTEXT_ACTION_LIST` response
const DOWNLOAD_RESPONSE_HEADER_SIZE: usize = 11;

/// MD5 of `data`
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

/// Request frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Always [`PROTOCOL_VERSION`] when sent by the host
    pub protocol_version: u32,
    /// Control opcode
    pub opcode: u32,
    /// Per-channel sequence number
    pub sequence: u32,
    /// Bytes following the header
    pub payload_len: u32,
}

/// Response frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Echo of the request opcode
    pub opcode: u32,
    /// Echo of the request sequence
    pub sequence: u32,
    /// `STATUS_SUCCESS` or a firmware error
    pub major_status: u32,
    /// Firmware detail code
    pub minor_status: u32,
}

macro_rules! header_codec {
    ($name:ident { $($field:ident),* }) => {
        impl $name {
            /// Encoded size
            pub const SIZE: usize = HEADER_SIZE;

            /// Append the little-endian encoding
            pub fn encode(&self, buf: &mut impl BufMut) {
                $( buf.put_u32_le(self.$field); )*
            }

            /// Consume a header from the front of `buf`
            ///
            /// # Errors
            ///
            /// Returns `Malformed` when fewer than [`HEADER_SIZE`] bytes remain.
            pub fn decode(buf: &mut impl Buf) -> Result<Self> {
                if buf.remaining() < HEADER_SIZE {
                    return Err(VdmaError::malformed(format!(
                        "Control header needs {HEADER_SIZE} bytes, got {}",
                        buf.remaining()
                    )));
                }
                Ok(Self { $( $field: buf.get_u32_le(), )* })
            }
        }
    };
}

header_codec!(RequestHeader { protocol_version, opcode, sequence, payload_len });
header_codec!(ResponseHeader { opcode, sequence, major_status, minor_status });

/// One firmware-sized chunk of a context's action program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextControl {
    /// First chunk of the context
    pub is_first: bool,
    /// Last chunk of the context
    pub is_last: bool,
    /// Records in `data`
    pub actions_count: u8,
    /// Encoded action records
    pub data: Vec<u8>,
}

/// Firmware version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u32,
    /// Minor version
    pub minor: u32,
    /// Revision
    pub revision: u32,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// `IDENTIFY` answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareIdentity {
    /// Control protocol version the firmware speaks
    pub protocol_version: u32,
    /// Firmware version
    pub version: FirmwareVersion,
}

/// A context's executed action list as reported by firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedActionList {
    /// Raw records, see [`crate::action_list`]
    pub data: Bytes,
    /// Device address the list was read from
    pub base_address: u32,
    /// Batches executed so far
    pub batch_counter: u32,
}

/// Control channel to one device's firmware
#[derive(Debug)]
pub struct FwControl {
    driver: Arc<dyn Driver>,
    sequence: AtomicU32,
    timeout: Duration,
}

impl FwControl {
    /// Control channel with the default timeout
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            sequence: AtomicU32::new(0),
            timeout: Duration::from_millis(DEFAULT_CONTROL_TIMEOUT_MS),
        }
    }

    /// Override the per-control timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send one control and return its response payload
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an oversized payload, the driver error,
    /// `DigestMismatch`, `Malformed` or `FirmwareControl`.
    pub fn request(&self, opcode: u32, payload: &[u8], cpu_id: CpuId) -> Result<Bytes> {
        if HEADER_SIZE + payload.len() > MAX_CONTROL_LENGTH {
            return Err(VdmaError::invalid_argument(format!(
                "Control {opcode:#x} payload of {} bytes exceeds {}",
                payload.len(),
                MAX_CONTROL_LENGTH - HEADER_SIZE
            )));
        }
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        RequestHeader {
            protocol_version: PROTOCOL_VERSION,
            opcode,
            sequence,
            payload_len: payload.len() as u32,
        }
        .encode(&mut frame);
        frame.put_slice(payload);

        let response = self
            .driver
            .fw_control(&frame, &md5_digest(&frame), self.timeout, cpu_id)
            .inspect_err(|e| tracing::error!("Control {opcode:#x} failed in the driver: {e}"))?;
        parse_response(opcode, sequence, response)
    }

    /// Query firmware identity
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); `Malformed` for a short answer.
    pub fn identify(&self) -> Result<FirmwareIdentity> {
        let mut response = self.request(opcode::IDENTIFY, &[], CpuId::App)?;
        if response.remaining() < 16 {
            return Err(VdmaError::malformed(format!(
                "Identify response of {} bytes",
                response.remaining()
            )));
        }
        Ok(FirmwareIdentity {
            protocol_version: response.get_u32_le(),
            version: FirmwareVersion {
                major: response.get_u32_le(),
                minor: response.get_u32_le(),
                revision: response.get_u32_le(),
            },
        })
    }

    /// Send the serialized network-group header
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub fn set_network_group_header(&self, header: &[u8]) -> Result<()> {
        self.request(opcode::SET_NETWORK_GROUP_HEADER, header, CpuId::Core)?;
        Ok(())
    }

    /// Send every control chunk of one context
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a chunk too large for one frame, or see
    /// [`request`](Self::request).
    pub fn set_context_info(&self, kind: ContextKind, controls: &[ContextControl]) -> Result<()> {
        for control in controls {
            let data_len = u16::try_from(control.data.len()).map_err(|_| {
                VdmaError::invalid_argument(format!(
                    "Context control of {} bytes does not fit one frame",
                    control.data.len()
                ))
            })?;
            let mut payload = Vec::with_capacity(CONTEXT_INFO_HEADER_SIZE + control.data.len());
            payload.put_u8(u8::from(control.is_first));
            payload.put_u8(u8::from(control.is_last));
            payload.put_u8(kind.as_u8());
            payload.put_u8(control.actions_count);
            payload.put_u16_le(data_len);
            payload.put_slice(&control.data);
            self.request(opcode::SET_CONTEXT_INFO, &payload, CpuId::Core)?;
        }
        tracing::debug!("Sent {} control(s) for {kind:?} context", controls.len());
        Ok(())
    }

    /// Move the context-switch state machine
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub fn change_context_switch_status(
        &self,
        state: u8,
        network_group_index: u8,
        dynamic_batch_size: u16,
        keep_nn_config: bool,
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(5);
        payload.put_u8(state);
        payload.put_u8(network_group_index);
        payload.put_u16_le(dynamic_batch_size);
        payload.put_u8(u8::from(keep_nn_config));
        self.request(opcode::CHANGE_CONTEXT_SWITCH_STATUS, &payload, CpuId::Core)?;
        Ok(())
    }

    /// Download the action list firmware executed for one context
    ///
    /// `context_index` counts contexts of the same kind.
    ///
    /// # Errors
    ///
    /// `Malformed` or `Truncated` for a bad chunk, `Malformed` for a list
    /// over [`MAX_ACTION_LIST_SIZE`], or see [`request`](Self::request).
    pub fn download_context_action_list(
        &self,
        network_group_id: u32,
        kind: ContextKind,
        context_index: u8,
    ) -> Result<DownloadedActionList> {
        let mut data = BytesMut::new();
        let (mut base_address, mut batch_counter) = (0, 0);
        loop {
            let mut payload = Vec::with_capacity(10);
            payload.put_u32_le(network_group_id);
            payload.put_u8(kind.as_u8());
            payload.put_u8(context_index);
            payload.put_u32_le(data.len() as u32);
            let mut response =
                self.request(opcode::DOWNLOAD_CONTEXT_ACTION_LIST, &payload, CpuId::Core)?;

            if response.remaining() < DOWNLOAD_RESPONSE_HEADER_SIZE {
                return Err(VdmaError::malformed(format!(
                    "Action list chunk of {} bytes",
                    response.remaining()
                )));
            }
            base_address = response.get_u32_le();
            batch_counter = response.get_u32_le();
            let is_last = response.get_u8() != 0;
            let chunk_len = usize::from(response.get_u16_le());
            if response.remaining() < chunk_len {
                return Err(VdmaError::Truncated {
                    needed: chunk_len,
                    remaining: response.remaining(),
                    offset: data.len(),
                });
            }
            data.put(response.split_to(chunk_len));

            if data.len() > MAX_ACTION_LIST_SIZE {
                return Err(VdmaError::malformed(format!(
                    "Action list exceeds {MAX_ACTION_LIST_SIZE} bytes"
                )));
            }
            if is_last {
                break;
            }
            if chunk_len == 0 {
                return Err(VdmaError::malformed("Empty action list chunk before the last one"));
            }
        }

        tracing::debug!(
            "Downloaded {} byte action list of {kind:?} context {context_index}",
            data.len()
        );
        Ok(DownloadedActionList {
            data: data.freeze(),
            base_address,
            batch_counter,
        })
    }
}

fn parse_response(opcode: u32, sequence: u32, response: FwControlResponse) -> Result<Bytes> {
    if md5_digest(&response.response) != response.md5 {
        tracing::error!("Control {opcode:#x} response failed its digest check");
        return Err(VdmaError::DigestMismatch);
    }
    let mut buf = Bytes::from(response.response);
    let header = ResponseHeader::decode(&mut buf)?;
    if header.opcode != opcode || header.sequence != sequence {
        return Err(VdmaError::malformed(format!(
            "Response {:#x}/{} does not match request {opcode:#x}/{sequence}",
            header.opcode, header.sequence
        )));
    }
    if header.major_status != STATUS_SUCCESS {
        tracing::error!(
            "Firmware failed control {opcode:#x}: major {}, minor {}",
            header.major_status,
            header.minor_status
        );
        return Err(VdmaError::FirmwareControl {
            opcode,
            major: header.major_status,
            minor: header.minor_status,
        });
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{DeviceEvent, SoftwareDriver};
    use hailo_chip::control::switch_status;

    fn control() -> (Arc<SoftwareDriver>, FwControl) {
        let sim = Arc::new(SoftwareDriver::new());
        let control = FwControl::new(sim.clone());
        (sim, control)
    }

    fn framed(header: ResponseHeader, payload: &[u8]) -> FwControlResponse {
        let mut response = Vec::new();
        header.encode(&mut response);
        response.extend_from_slice(payload);
        let md5 = md5_digest(&response);
        FwControlResponse { response, md5 }
    }

    #[test]
    fn test_identify_and_sequence() {
        let (sim, control) = control();
        let identity = control.identify().unwrap();
        assert_eq!(identity.protocol_version, PROTOCOL_VERSION);
        assert_eq!(identity.version.to_string(), "4.17.0");
        control.identify().unwrap();
        assert_eq!(control.sequence.load(Ordering::Relaxed), 2);
        assert_eq!(
            sim.events(),
            [
                DeviceEvent::Control { opcode: opcode::IDENTIFY },
                DeviceEvent::Control { opcode: opcode::IDENTIFY },
            ]
        );
    }

    #[test]
    fn test_digest_mismatch_is_distinct() {
        let (sim, control) = control();
        sim.corrupt_next_response_digest();
        assert!(matches!(control.identify(), Err(VdmaError::DigestMismatch)));
        // only the next response is corrupted
        control.identify().unwrap();
    }

    #[test]
    fn test_firmware_status_surfaces() {
        let (_sim, control) = control();
        assert!(matches!(
            control.request(0x7777, &[], CpuId::App),
            Err(VdmaError::FirmwareControl { opcode: 0x7777, major: 1, minor: 0 })
        ));
    }

    #[test]
    fn test_response_validation() {
        let ok = ResponseHeader {
            opcode: 5,
            sequence: 9,
            major_status: STATUS_SUCCESS,
            minor_status: 0,
        };
        let payload = parse_response(5, 9, framed(ok, &[1, 2])).unwrap();
        assert_eq!(&payload[..], &[1, 2]);

        assert!(matches!(
            parse_response(5, 10, framed(ok, &[])),
            Err(VdmaError::Malformed { .. })
        ));
        assert!(matches!(
            parse_response(6, 9, framed(ok, &[])),
            Err(VdmaError::Malformed { .. })
        ));

        let short = vec![0u8; 8];
        let md5 = md5_digest(&short);
        assert!(matches!(
            parse_response(5, 9, FwControlResponse { response: short, md5 }),
            Err(VdmaError::Malformed { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let (_sim, control) = control();
        let payload = vec![0u8; MAX_CONTROL_LENGTH];
        assert!(matches!(
            control.request(opcode::SET_NETWORK_GROUP_HEADER, &payload, CpuId::Core),
            Err(VdmaError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_context_upload_and_download() {
        let (sim, control) = control();
        control.set_network_group_header(&[0; 8]).unwrap();

        let first: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        let second: Vec<u8> = vec![0xAB; 300];
        let controls = [
            ContextControl {
                is_first: true,
                is_last: false,
                actions_count: 10,
                data: first.clone(),
            },
            ContextControl {
                is_first: false,
                is_last: true,
                actions_count: 3,
                data: second.clone(),
            },
        ];
        control.set_context_info(ContextKind::Dynamic, &controls).unwrap();
        control
            .change_context_switch_status(switch_status::ENABLED, 0, 1, false)
            .unwrap();

        let list = control
            .download_context_action_list(0, ContextKind::Dynamic, 0)
            .unwrap();
        assert_eq!(list.data.len(), 1324);
        assert_eq!(&list.data[..1024], &first[..]);
        assert_eq!(&list.data[1024..], &second[..]);
        assert_eq!(list.batch_counter, 1);

        assert!(matches!(
            control.download_context_action_list(0, ContextKind::Dynamic, 1),
            Err(VdmaError::FirmwareControl { .. })
        ));
        assert!(sim
            .events()
            .contains(&DeviceEvent::ContextSwitchStatus(switch_status::ENABLED)));
    }
}
