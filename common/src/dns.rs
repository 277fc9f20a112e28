//! Captive-portal DNS: every A query is answered with the access point's own
//! address, so phones open the setup page when they check for internet.

use std::net::Ipv4Addr;

pub const DNS_PORT: u16 = 53;
pub const MAX_DNS_PACKET: usize = 512;

const HEADER_LEN: usize = 12;
const ANSWER_TTL_SECS: u32 = 60;

/// Builds the reply for one query packet. Packets that are not a standard
/// query with at least one question get no reply.
pub fn captive_answer(query: &[u8], answer_ip: Ipv4Addr) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let is_response = query[2] & 0x80 != 0;
    let opcode = (query[2] >> 3) & 0x0F;
    let questions = u16::from_be_bytes([query[4], query[5]]);
    if is_response || opcode != 0 || questions == 0 {
        return None;
    }

    let question_end = question_end(query)?;
    let mut reply = Vec::with_capacity(question_end + 16);
    reply.extend_from_slice(&query[..question_end]);

    // QR and AA set, RD copied from the query.
    reply[2] = 0x84 | (query[2] & 0x01);
    reply[3] = 0x00;
    reply[4..6].copy_from_slice(&1u16.to_be_bytes());
    reply[6..8].copy_from_slice(&1u16.to_be_bytes());
    reply[8..12].fill(0);

    // Name as a pointer to the question at offset 12, type A, class IN.
    reply.extend_from_slice(&[0xC0, 0x0C, 0x00, 0x01, 0x00, 0x01]);
    reply.extend_from_slice(&ANSWER_TTL_SECS.to_be_bytes());
    reply.extend_from_slice(&4u16.to_be_bytes());
    reply.extend_from_slice(&answer_ip.octets());
    (reply.len() <= MAX_DNS_PACKET).then_some(reply)
}

/// Offset just past the first question (name, type, class).
fn question_end(packet: &[u8]) -> Option<usize> {
    let mut pos = HEADER_LEN;
    loop {
        let len = usize::from(*packet.get(pos)?);
        if len == 0 {
            pos += 1;
            break;
        }
        // Compression pointers never appear in a query's first name.
        if len & 0xC0 != 0 {
            return None;
        }
        pos += 1 + len;
    }
    let end = pos + 4;
    (end <= packet.len()).then_some(end)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);

    fn query_for(name: &str, extra: &[u8]) -> Vec<u8> {
        let mut packet = vec![
            0x12, 0x34, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
        if !extra.is_empty() {
            packet[11] = 0x01;
            packet.extend_from_slice(extra);
        }
        packet
    }

    #[test]
    fn any_name_resolves_to_the_access_point() {
        let query = query_for("connectivitycheck.gstatic.com", &[]);
        let reply = captive_answer(&query, AP_IP).unwrap();

        assert_eq!(&reply[..2], &[0x12, 0x34]);
        assert_eq!(reply[2], 0x85);
        assert_eq!(&reply[4..12], &[0, 1, 0, 1, 0, 0, 0, 0]);
        assert_eq!(&reply[12..query.len()], &query[12..]);
        assert_eq!(&reply[reply.len() - 4..], &[192, 168, 4, 1]);
        assert_eq!(reply.len(), query.len() + 16);
    }

    #[test]
    fn additional_records_are_not_echoed() {
        // EDNS OPT record as sent by most resolvers.
        let opt = [0x00, 0x00, 0x29, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let query = query_for("captive.apple.com", &opt);
        let reply = captive_answer(&query, AP_IP).unwrap();

        assert_eq!(&reply[10..12], &[0, 0]);
        assert_eq!(reply.len(), query.len() - opt.len() + 16);
    }

    #[test]
    fn malformed_or_non_query_packets_are_ignored() {
        assert_eq!(captive_answer(&[0u8; 5], AP_IP), None);

        let mut response = query_for("example.org", &[]);
        response[2] |= 0x80;
        assert_eq!(captive_answer(&response, AP_IP), None);

        let mut truncated = query_for("example.org", &[]);
        truncated.truncate(truncated.len() - 3);
        assert_eq!(captive_answer(&truncated, AP_IP), None);

        let mut no_question = query_for("example.org", &[]);
        no_question[5] = 0;
        assert_eq!(captive_answer(&no_question, AP_IP), None);
    }
}
