//! Modbus frame handling
//!
//! PDU construction/parsing for the four read function families, MBAP
//! headers for TCP mode and CRC-checked RTU framing. Write operations are
//! not built here; acquisition is read-only.

use crate::error::{ModbusError, Result};

/// Read coils (0x01).
pub const FC_READ_COILS: u8 = 0x01;
/// Read discrete inputs (0x02).
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
/// Read holding registers (0x03).
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Read input registers (0x04).
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

const MAX_REGISTERS_PER_READ: u16 = 125;
const MAX_BITS_PER_READ: u16 = 2000;

/// Whether a function code belongs to the bit-level read family.
pub fn is_bit_function(function_code: u8) -> bool {
    matches!(function_code, FC_READ_COILS | FC_READ_DISCRETE_INPUTS)
}

/// Whether a function code belongs to the register-level read family.
pub fn is_register_function(function_code: u8) -> bool {
    matches!(function_code, FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS)
}

/// Human-readable description of a Modbus exception code.
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal function",
        0x02 => "Illegal data address",
        0x03 => "Illegal data value",
        0x04 => "Slave device failure",
        0x05 => "Acknowledge",
        0x06 => "Slave device busy",
        0x07 => "Negative acknowledge",
        0x08 => "Memory parity error",
        0x0A => "Gateway path unavailable",
        0x0B => "Gateway target device failed to respond",
        _ => "Unknown exception",
    }
}

/// Build a read-request PDU: function code, start address, quantity.
pub fn build_read_request(function_code: u8, address: u16, count: u16) -> Result<Vec<u8>> {
    let limit = if is_bit_function(function_code) {
        MAX_BITS_PER_READ
    } else if is_register_function(function_code) {
        MAX_REGISTERS_PER_READ
    } else {
        return Err(ModbusError::UnsupportedFunction(format!(
            "0x{function_code:02X} is not a read function"
        )));
    };
    if count == 0 || count > limit {
        return Err(ModbusError::invalid_request(format!(
            "read count {count} outside 1-{limit} for function 0x{function_code:02X}"
        )));
    }

    let mut pdu = Vec::with_capacity(5);
    pdu.push(function_code);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&count.to_be_bytes());
    Ok(pdu)
}

/// Parse a read-response PDU into raw words.
///
/// Register responses yield one word per register; bit responses unpack
/// LSB-first into one 0/1 word per requested point. Exception responses
/// surface as `ModbusError::Exception` with the decoded description.
pub fn parse_read_response(pdu: &[u8], function_code: u8, count: u16) -> Result<Vec<u16>> {
    if pdu.is_empty() {
        return Err(ModbusError::protocol("empty response PDU"));
    }

    // Exception responses echo the function code with the high bit set
    if pdu[0] == function_code | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(ModbusError::Exception {
            code,
            description: exception_description(code).to_string(),
        });
    }
    if pdu[0] != function_code {
        return Err(ModbusError::protocol(format!(
            "function code mismatch: sent 0x{function_code:02X}, received 0x{:02X}",
            pdu[0]
        )));
    }
    if pdu.len() < 2 {
        return Err(ModbusError::protocol("response PDU truncated before byte count"));
    }

    let byte_count = pdu[1] as usize;
    let data = &pdu[2..];
    if data.len() < byte_count {
        return Err(ModbusError::protocol(format!(
            "response data truncated: expected {byte_count} bytes, received {}",
            data.len()
        )));
    }
    let data = &data[..byte_count];

    if is_bit_function(function_code) {
        let expected_bytes = (count as usize).div_ceil(8);
        if byte_count < expected_bytes {
            return Err(ModbusError::protocol(format!(
                "bit response too short: {byte_count} bytes for {count} points"
            )));
        }
        let mut words = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let bit = (data[i / 8] >> (i % 8)) & 1;
            words.push(bit as u16);
        }
        Ok(words)
    } else {
        let expected_bytes = count as usize * 2;
        if byte_count != expected_bytes {
            return Err(ModbusError::protocol(format!(
                "register response byte count {byte_count} does not match {count} registers"
            )));
        }
        let words = data
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(words)
    }
}

// ----------------------------------------------------------------------------
// TCP (MBAP) framing
// ----------------------------------------------------------------------------

/// MBAP header prefixed to every Modbus TCP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    /// Slave address
    pub unit_id: u8,
}

/// Size of the MBAP header on the wire.
pub const MBAP_HEADER_LEN: usize = 7;

impl MbapHeader {
    pub fn new(transaction_id: u16, unit_id: u8, pdu_length: u16) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1,
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let mut bytes = [0u8; MBAP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < MBAP_HEADER_LEN {
            return Err(ModbusError::protocol("MBAP header truncated"));
        }
        let protocol_id = u16::from_be_bytes([data[2], data[3]]);
        if protocol_id != 0 {
            return Err(ModbusError::protocol(format!(
                "unexpected MBAP protocol id {protocol_id}"
            )));
        }
        let length = u16::from_be_bytes([data[4], data[5]]);
        if length == 0 {
            return Err(ModbusError::protocol("MBAP length field is zero"));
        }
        Ok(Self {
            transaction_id: u16::from_be_bytes([data[0], data[1]]),
            protocol_id,
            length,
            unit_id: data[6],
        })
    }

    /// Length of the PDU that follows the header.
    pub fn pdu_length(&self) -> usize {
        self.length as usize - 1
    }
}

/// Wrap a PDU in an MBAP header for TCP transmission.
pub fn build_tcp_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let header = MbapHeader::new(transaction_id, unit_id, pdu.len() as u16);
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(pdu);
    frame
}

// ----------------------------------------------------------------------------
// RTU framing
// ----------------------------------------------------------------------------

/// CRC-16/MODBUS: polynomial 0xA001 (reflected 0x8005), initial 0xFFFF.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFFu16;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Wrap a PDU in RTU framing: slave address + PDU + little-endian CRC.
pub fn build_rtu_frame(slave_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + pdu.len() + 2);
    frame.push(slave_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Validate an RTU frame and strip the address and CRC trailer.
pub fn parse_rtu_frame(frame: &[u8], expected_slave: u8) -> Result<Vec<u8>> {
    if frame.len() < 4 {
        return Err(ModbusError::protocol("RTU frame too short"));
    }
    let crc_offset = frame.len() - 2;
    let received = u16::from_le_bytes([frame[crc_offset], frame[crc_offset + 1]]);
    let calculated = crc16(&frame[..crc_offset]);
    if received != calculated {
        return Err(ModbusError::protocol(format!(
            "RTU CRC mismatch: expected 0x{calculated:04X}, received 0x{received:04X}"
        )));
    }
    if frame[0] != expected_slave {
        return Err(ModbusError::protocol(format!(
            "RTU slave address mismatch: expected {expected_slave}, received {}",
            frame[0]
        )));
    }
    Ok(frame[1..crc_offset].to_vec())
}

/// Expected total length of an RTU read response, once enough of it has
/// arrived to tell. `None` means more bytes are required.
pub fn expected_rtu_response_len(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < 2 {
        return None;
    }
    let function_code = buffer[1];
    // Exception: address + function + exception code + CRC
    if function_code & 0x80 != 0 {
        return Some(5);
    }
    match function_code {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS => {
            // Address + function + byte count + data + CRC
            let byte_count = *buffer.get(2)? as usize;
            Some(3 + byte_count + 2)
        },
        // Anything else is not a response we ever solicit; let the caller
        // fail the CRC/function checks on whatever arrives
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    // ========== CRC ==========

    #[test]
    fn test_crc16_known_vectors() {
        // Wire trailers are little-endian: 95 CB and C0 F1
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x01, 0x00, 0x02]), 0xCB95);
        assert_eq!(crc16(&[0x01, 0x83, 0x02]), 0xF1C0);
    }

    // ========== PDU construction ==========

    #[test]
    fn test_build_read_request() {
        let pdu = build_read_request(FC_READ_HOLDING_REGISTERS, 0x0001, 0x000A).unwrap();
        assert_eq!(pdu, vec![0x03, 0x00, 0x01, 0x00, 0x0A]);
    }

    #[test]
    fn test_build_read_request_rejects_bad_counts() {
        assert!(build_read_request(FC_READ_HOLDING_REGISTERS, 0, 0).is_err());
        assert!(build_read_request(FC_READ_HOLDING_REGISTERS, 0, 126).is_err());
        assert!(build_read_request(FC_READ_COILS, 0, 2001).is_err());
        assert!(build_read_request(FC_READ_COILS, 0, 2000).is_ok());
    }

    #[test]
    fn test_build_read_request_rejects_write_functions() {
        let err = build_read_request(0x06, 0, 1).unwrap_err();
        assert!(matches!(err, ModbusError::UnsupportedFunction(_)));
    }

    // ========== Response parsing ==========

    #[test]
    fn test_parse_register_response() {
        let pdu = [0x03, 0x04, 0x12, 0x34, 0x56, 0x78];
        let words = parse_read_response(&pdu, FC_READ_HOLDING_REGISTERS, 2).unwrap();
        assert_eq!(words, vec![0x1234, 0x5678]);
    }

    #[test]
    fn test_parse_bit_response_lsb_first() {
        // 0xCD = 1100_1101: points 0,2,3,6,7 on
        let pdu = [0x01, 0x02, 0xCD, 0x01];
        let words = parse_read_response(&pdu, FC_READ_COILS, 9).unwrap();
        assert_eq!(words, vec![1, 0, 1, 1, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_parse_exception_response() {
        let pdu = [0x83, 0x02];
        let err = parse_read_response(&pdu, FC_READ_HOLDING_REGISTERS, 1).unwrap_err();
        match err {
            ModbusError::Exception { code, description } => {
                assert_eq!(code, 0x02);
                assert_eq!(description, "Illegal data address");
            },
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_parse_response_function_mismatch() {
        let pdu = [0x04, 0x02, 0x00, 0x01];
        let err = parse_read_response(&pdu, FC_READ_HOLDING_REGISTERS, 1).unwrap_err();
        assert!(matches!(err, ModbusError::Protocol(_)));
    }

    #[test]
    fn test_parse_response_byte_count_mismatch() {
        let pdu = [0x03, 0x02, 0x00, 0x01];
        assert!(parse_read_response(&pdu, FC_READ_HOLDING_REGISTERS, 2).is_err());

        let truncated = [0x03, 0x04, 0x00, 0x01];
        assert!(parse_read_response(&truncated, FC_READ_HOLDING_REGISTERS, 2).is_err());
    }

    // ========== MBAP ==========

    #[test]
    fn test_mbap_header_round_trip() {
        let header = MbapHeader::new(0x1234, 0x01, 5);
        assert_eq!(header.length, 6);

        let bytes = header.to_bytes();
        assert_eq!(bytes, [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01]);

        let parsed = MbapHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.pdu_length(), 5);
    }

    #[test]
    fn test_mbap_rejects_bad_protocol_id() {
        let bytes = [0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01];
        assert!(MbapHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_build_tcp_frame() {
        let pdu = [0x03, 0x00, 0x01, 0x00, 0x02];
        let frame = build_tcp_frame(0x1234, 0x01, &pdu);
        assert_eq!(
            frame,
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x02]
        );
    }

    // ========== RTU ==========

    #[test]
    fn test_rtu_frame_round_trip() {
        let pdu = [0x03, 0x00, 0x01, 0x00, 0x02];
        let frame = build_rtu_frame(0x01, &pdu);
        assert_eq!(frame.len(), 8);
        assert_eq!(frame[0], 0x01);
        assert_eq!(&frame[1..6], &pdu);

        let recovered = parse_rtu_frame(&frame, 0x01).unwrap();
        assert_eq!(recovered, pdu.to_vec());
    }

    #[test]
    fn test_rtu_frame_rejects_corruption() {
        let mut frame = build_rtu_frame(0x01, &[0x03, 0x02, 0x00, 0x64]);
        frame[3] ^= 0xFF;
        assert!(parse_rtu_frame(&frame, 0x01).is_err());
    }

    #[test]
    fn test_rtu_frame_rejects_wrong_slave() {
        let frame = build_rtu_frame(0x05, &[0x03, 0x02, 0x00, 0x64]);
        assert!(parse_rtu_frame(&frame, 0x01).is_err());
    }

    #[test]
    fn test_expected_rtu_response_len() {
        assert_eq!(expected_rtu_response_len(&[0x01]), None);
        // Read response: 3 header bytes + 2 data + 2 CRC
        assert_eq!(expected_rtu_response_len(&[0x01, 0x03, 0x02]), Some(7));
        // Byte count not yet received
        assert_eq!(expected_rtu_response_len(&[0x01, 0x03]), None);
        // Exception response is always 5 bytes
        assert_eq!(expected_rtu_response_len(&[0x01, 0x83]), Some(5));
        assert_eq!(expected_rtu_response_len(&[0x01, 0x10, 0x00]), None);
    }
}
