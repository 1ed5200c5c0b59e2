use super::{job_header, wrap_tpkt, ROSCTR_ACK_DATA, S7_PROTOCOL_ID, TPKT_COTP_LEN, TPKT_VERSION};
use crate::error::CodecError;

/// Connect as programming device.
pub const CONNECTION_TYPE_PG: u16 = 0x01;
pub const LOCAL_TSAP: u16 = 0x0100;

const COTP_CONNECTION_REQUEST: u8 = 0xE0;
const COTP_CONNECTION_CONFIRM: u8 = 0xD0;
const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;

/// Remote TSAP addressing the CPU at `rack`/`slot`.
pub fn remote_tsap(connection_type: u16, rack: u16, slot: u16) -> u16 {
    (connection_type << 8) + rack * 0x20 + slot
}

/// COTP connection request (22 bytes).
#[rustfmt::skip]
pub fn build_connection_request(local_tsap: u16, remote_tsap: u16) -> Vec<u8> {
    let [lh, ll] = local_tsap.to_be_bytes();
    let [rh, rl] = remote_tsap.to_be_bytes();
    vec![
        TPKT_VERSION, 0x00, 0x00, 0x16,
        0x11, COTP_CONNECTION_REQUEST,
        0x00, 0x00, // destination reference
        0x00, 0x01, // source reference
        0x00, // class 0
        0xC0, 0x01, 0x0A, // TPDU size 1024
        0xC1, 0x02, lh, ll,
        0xC2, 0x02, rh, rl,
    ]
}

pub fn check_connection_confirm(frame: &[u8]) -> Result<(), CodecError> {
    if frame.len() < 7 || frame[0] != TPKT_VERSION {
        return Err(CodecError::Malformed(format!(
            "connection confirm too short ({} bytes)",
            frame.len()
        )));
    }
    if frame[5] != COTP_CONNECTION_CONFIRM {
        return Err(CodecError::Rejected(format!(
            "ISO connection refused (PDU type 0x{:02x})",
            frame[5]
        )));
    }
    Ok(())
}

/// S7 setup-communication job negotiating the PDU length.
pub fn build_setup_communication(pdu_ref: u16, pdu_len: u16) -> Vec<u8> {
    let mut pdu = job_header(pdu_ref, 8, 0);
    pdu.extend_from_slice(&[FUNC_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01]);
    pdu.extend_from_slice(&pdu_len.to_be_bytes());
    wrap_tpkt(&pdu)
}

/// Returns the PDU length granted by the CPU.
pub fn parse_setup_communication(frame: &[u8]) -> Result<u16, CodecError> {
    if frame.len() < TPKT_COTP_LEN + 20 {
        return Err(CodecError::Malformed(format!(
            "setup communication response too short ({} bytes)",
            frame.len()
        )));
    }
    let s7 = &frame[TPKT_COTP_LEN..];
    if s7[0] != S7_PROTOCOL_ID || s7[1] != ROSCTR_ACK_DATA {
        return Err(CodecError::Malformed("unexpected S7 header".to_string()));
    }
    if s7[10] != 0 || s7[11] != 0 {
        return Err(CodecError::Rejected(format!(
            "PDU negotiation refused (class 0x{:02x} code 0x{:02x})",
            s7[10], s7[11]
        )));
    }
    let granted = u16::from_be_bytes([s7[18], s7[19]]);
    if granted == 0 {
        return Err(CodecError::Rejected("CPU granted a zero PDU length".to_string()));
    }
    Ok(granted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_tsap_for_rack_slot() {
        assert_eq!(remote_tsap(CONNECTION_TYPE_PG, 0, 2), 0x0102);
        assert_eq!(remote_tsap(CONNECTION_TYPE_PG, 0, 1), 0x0101);
        assert_eq!(remote_tsap(CONNECTION_TYPE_PG, 1, 3), 0x0123);
    }

    #[test]
    fn test_setup_communication_layout() {
        let frame = build_setup_communication(1, 480);
        assert_eq!(frame.len(), 25);
        assert_eq!(&frame[..4], &[0x03, 0x00, 0x00, 0x19]);
        assert_eq!(&frame[23..], &[0x01, 0xE0]);
    }

    #[test]
    fn test_parse_setup_communication() {
        let mut resp = vec![0x03, 0x00, 0x00, 0x1B, 0x02, 0xF0, 0x80];
        resp.extend_from_slice(&[0x32, 0x03, 0x00, 0x00, 0x00, 0x01, 0x00, 0x08, 0x00, 0x00]);
        resp.extend_from_slice(&[0x00, 0x00]);
        resp.extend_from_slice(&[0xF0, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0xF0]);
        assert_eq!(parse_setup_communication(&resp).unwrap(), 240);

        resp[17] = 0x81;
        assert!(matches!(
            parse_setup_communication(&resp),
            Err(CodecError::Rejected(_))
        ));
    }

    #[test]
    fn test_connection_confirm() {
        let mut cc = build_connection_request(LOCAL_TSAP, 0x0102);
        assert_eq!(cc.len(), 22);
        assert!(check_connection_confirm(&cc).is_err());
        cc[5] = 0xD0;
        assert!(check_connection_confirm(&cc).is_ok());
    }
}
