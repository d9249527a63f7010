use crate::config::{PortOrRange, PortSpec};
use crate::error::ConfigError;

/// One concrete public-to-local port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub public: u16,
    pub local: u16,
}

/// Parse an inclusive `"start-end"` range into its bounds.
fn parse_bounds(s: &str) -> Result<(u16, u16), ConfigError> {
    let invalid = || ConfigError::InvalidPortRange(s.to_string());
    let (start, end) = s.split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

/// Parse an inclusive `"start-end"` range into its ports.
fn parse_range(s: &str) -> Result<Vec<u16>, ConfigError> {
    let (start, end) = parse_bounds(s)?;
    Ok((start..=end).collect())
}

impl PortOrRange {
    fn ports(&self) -> Result<Vec<u16>, ConfigError> {
        match self {
            PortOrRange::Port(p) => Ok(vec![*p]),
            PortOrRange::Range(s) => parse_range(s),
        }
    }
}

impl PortSpec {
    /// Expand to discrete `(pub, local)` pairs.
    ///
    /// A bare port or range maps identically on both sides. An explicit pair
    /// zips the i-th public port with the i-th local port and fails when the
    /// two sides cover a different number of ports — that mapping is
    /// unusable, so it is rejected before any rule or bind is attempted.
    pub fn expand(&self) -> Result<Vec<PortPair>, ConfigError> {
        match self {
            PortSpec::Port(p) => Ok(vec![PortPair {
                public: *p,
                local: *p,
            }]),
            PortSpec::Range(s) => Ok(parse_range(s)?
                .into_iter()
                .map(|p| PortPair {
                    public: p,
                    local: p,
                })
                .collect()),
            PortSpec::Pair { public, local } => {
                let public = public.ports()?;
                let local = local.ports()?;
                if public.len() != local.len() {
                    return Err(ConfigError::PortRangeMismatch {
                        public: public.len(),
                        local: local.len(),
                    });
                }
                Ok(public
                    .into_iter()
                    .zip(local)
                    .map(|(p, l)| PortPair {
                        public: p,
                        local: l,
                    })
                    .collect())
            }
        }
    }

    /// The public side of the spec as an iptables port expression: a bare
    /// port number, or a colon-separated inclusive range covering the whole
    /// spec with one match.
    pub fn public_port_expr(&self) -> Result<String, ConfigError> {
        let public = match self {
            PortSpec::Port(p) => return Ok(p.to_string()),
            PortSpec::Range(s) => s,
            PortSpec::Pair {
                public: PortOrRange::Port(p),
                ..
            } => return Ok(p.to_string()),
            PortSpec::Pair {
                public: PortOrRange::Range(s),
                ..
            } => s,
        };
        let (start, end) = parse_bounds(public)?;
        Ok(format!("{start}:{end}"))
    }
}

/// Expand every spec of a server, failing on the first invalid one.
pub fn expand_all(specs: &[PortSpec]) -> Result<Vec<PortPair>, ConfigError> {
    let mut pairs = Vec::new();
    for spec in specs {
        pairs.extend(spec.expand()?);
    }
    Ok(pairs)
}
