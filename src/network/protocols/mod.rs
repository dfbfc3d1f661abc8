//! Protocol-specific packet builders
//!
//! Only DNS is needed by the pipeline: the UDP name service speaks it
//! directly to the configured nameservers.

mod dns;

pub use dns::{parse_answer, DnsAnswer, DnsQuery, DnsQuestion, DnsRcode, DnsType};
