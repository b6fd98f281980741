use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Report;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Lines starting with this prefix are the manager's only machine-readable
/// output.
pub const FLOW_PREFIX: &str = "FLOW: ";

/// One directed byte count over one time window, as printed by the manager
/// and consumed by the analyzer.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub src_ip: IpAddr,
    pub dest_ip: IpAddr,
    pub dest_port: u16,
    /// Epoch seconds at the initiator's begin.
    pub start: i64,
    /// Elapsed seconds.
    pub elapsed: f64,
    pub bytes: u64,
}

impl FlowRecord {
    pub fn end(&self) -> f64 {
        self.start as f64 + self.elapsed
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} {} {} {} {:.2} {}",
            FLOW_PREFIX,
            self.src_ip,
            self.dest_ip,
            self.dest_port,
            self.start,
            self.elapsed,
            self.bytes
        )
    }
}

impl FromStr for FlowRecord {
    type Err = Report;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let rest = line
            .strip_prefix(FLOW_PREFIX)
            .ok_or_else(|| eyre!("not a flow line: {:?}", line))?;
        // positional: src dest port start elapsed bytes
        let fields: Vec<_> = rest.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(eyre!(
                "flow line has {} fields, expected 6: {:?}",
                fields.len(),
                line
            ));
        }
        Ok(FlowRecord {
            src_ip: fields[0].parse().wrap_err("flow src_ip")?,
            dest_ip: fields[1].parse().wrap_err("flow dest_ip")?,
            dest_port: fields[2].parse().wrap_err("flow dest_port")?,
            start: fields[3].parse().wrap_err("flow start")?,
            elapsed: fields[4].parse().wrap_err("flow elapsed")?,
            bytes: fields[5].parse().wrap_err("flow bytes")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format() {
        let record = FlowRecord {
            src_ip: "10.0.0.1".parse().unwrap(),
            dest_ip: "10.0.0.2".parse().unwrap(),
            dest_port: 9000,
            start: 1_700_000_000,
            elapsed: 10.0,
            bytes: 123_456,
        };
        assert_eq!(
            record.to_string(),
            "FLOW: 10.0.0.1 10.0.0.2 9000 1700000000 10.00 123456"
        );
    }

    #[test]
    fn parse() {
        let record: FlowRecord =
            "FLOW: 10.0.0.1 10.0.0.2 9000 1700000000 10.25 123456"
                .parse()
                .unwrap();
        assert_eq!(record.src_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(record.dest_ip, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(record.dest_port, 9000);
        assert_eq!(record.start, 1_700_000_000);
        assert!((record.elapsed - 10.25).abs() < f64::EPSILON);
        assert_eq!(record.bytes, 123_456);
        assert!((record.end() - 1_700_000_010.25).abs() < 1e-6);
    }

    #[test]
    fn format_then_parse_agrees() {
        let record = FlowRecord {
            src_ip: "192.168.1.5".parse().unwrap(),
            dest_ip: "192.168.1.6".parse().unwrap(),
            dest_port: 40000,
            start: 1_700_000_123,
            elapsed: 59.99,
            bytes: 7,
        };
        let parsed: FlowRecord = record.to_string().parse().unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn rejects_other_lines() {
        assert!("Manager network address: 10.0.0.1:7777"
            .parse::<FlowRecord>()
            .is_err());
        // prefix must match exactly, including the space
        assert!("FLOW:10.0.0.1 10.0.0.2 9000 0 1.00 1"
            .parse::<FlowRecord>()
            .is_err());
        assert!("FLOW: 10.0.0.1 10.0.0.2 9000 0".parse::<FlowRecord>().is_err());
    }
}
