//! Logical endpoint addressing: `PYRO:`, `PYRONAME:`, `PYROLOC:` URIs.
//!
//! Grammar:
//! ```text
//! uri    := proto ':' object ( '@' host ':' port )?
//! proto  := "PYRO" | "PYRONAME" | "PYROLOC"
//! object := non-empty string, no whitespace, no '@'
//! host   := IPv4 literal | IPv6 literal in brackets | DNS name
//! port   := 1..65535
//! ```

use std::fmt;

use crate::error::PyroError;

/// One of the three URI schemes this workspace understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Pyro,
    Pyroname,
    Pyroloc,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Pyro => "PYRO",
            Protocol::Pyroname => "PYRONAME",
            Protocol::Pyroloc => "PYROLOC",
        }
    }

    fn parse(s: &str) -> Option<Protocol> {
        match s {
            "PYRO" => Some(Protocol::Pyro),
            "PYRONAME" => Some(Protocol::Pyroname),
            "PYROLOC" => Some(Protocol::Pyroloc),
            _ => None,
        }
    }
}

/// A concrete `host:port` location. `PYRO` and `PYROLOC` always carry one;
/// `PYRONAME` may omit it and rely on broadcast/name-server discovery
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable, parsed logical endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
    protocol: Protocol,
    object: String,
    location: Option<Location>,
}

impl Uri {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    pub fn host(&self) -> Option<&str> {
        self.location.as_ref().map(|loc| loc.host.as_str())
    }

    pub fn port(&self) -> Option<u16> {
        self.location.as_ref().map(|loc| loc.port)
    }

    /// Construct a `PYRO` URI; always carries a location.
    pub fn pyro(object: impl Into<String>, host: impl Into<String>, port: u16) -> Uri {
        Uri {
            protocol: Protocol::Pyro,
            object: object.into(),
            location: Some(Location {
                host: host.into(),
                port,
            }),
        }
    }

    /// Construct a `PYROLOC` URI; always carries a location.
    pub fn pyroloc(object: impl Into<String>, host: impl Into<String>, port: u16) -> Uri {
        Uri {
            protocol: Protocol::Pyroloc,
            object: object.into(),
            location: Some(Location {
                host: host.into(),
                port,
            }),
        }
    }

    /// Construct a `PYRONAME` URI, with or without an explicit location.
    pub fn pyroname(object: impl Into<String>, location: Option<(String, u16)>) -> Uri {
        Uri {
            protocol: Protocol::Pyroname,
            object: object.into(),
            location: location.map(|(host, port)| Location { host, port }),
        }
    }

    /// Parse `"<protocol>:<object>@<host>:<port>"` or `"<protocol>:<object>"`.
    ///
    /// Whitespace anywhere in the input is rejected. `PYRO`/`PYROLOC`
    /// require a location; `PYRONAME` may omit it.
    pub fn parse(s: &str) -> Result<Uri, PyroError> {
        if s.chars().any(char::is_whitespace) {
            return Err(invalid(s, "whitespace is not allowed in a uri"));
        }

        let (proto_str, rest) = s
            .split_once(':')
            .ok_or_else(|| invalid(s, "missing ':' separating protocol from object"))?;
        let protocol = Protocol::parse(proto_str)
            .ok_or_else(|| invalid(s, format!("unknown protocol `{proto_str}`")))?;

        let (object, location) = match split_object_location(rest) {
            Some((object, host, port_str)) => {
                if object.is_empty() {
                    return Err(invalid(s, "object id must not be empty"));
                }
                let port: u16 = port_str
                    .parse()
                    .ok()
                    .filter(|p| *p >= 1)
                    .ok_or_else(|| invalid(s, format!("invalid port `{port_str}`")))?;
                if host.is_empty() {
                    return Err(invalid(s, "host must not be empty"));
                }
                (
                    object.to_string(),
                    Some(Location {
                        host: host.to_string(),
                        port,
                    }),
                )
            }
            None => {
                if rest.is_empty() {
                    return Err(invalid(s, "object id must not be empty"));
                }
                (rest.to_string(), None)
            }
        };

        if matches!(protocol, Protocol::Pyro | Protocol::Pyroloc) && location.is_none() {
            return Err(invalid(
                s,
                format!("{} requires a host:port location", protocol.as_str()),
            ));
        }

        Ok(Uri {
            protocol,
            object,
            location,
        })
    }
}

/// Splits `"object@host:port"` into `(object, host, port)`. Returns `None`
/// when there is no `@`, i.e. no location was given. The host itself may
/// contain `:` only when bracketed as an IPv6 literal, so we split the
/// port off from the last `:`.
fn split_object_location(rest: &str) -> Option<(&str, &str, &str)> {
    let (object, location) = rest.split_once('@')?;
    let port_sep = location.rfind(':')?;
    let (host, port) = (&location[..port_sep], &location[port_sep + 1..]);
    Some((object, host, port))
}

fn invalid(uri: &str, reason: impl Into<String>) -> PyroError {
    PyroError::InvalidUri {
        uri: uri.to_string(),
        reason: reason.into(),
    }
}

impl fmt::Display for Uri {
    /// Exact inverse of `parse` for any syntactically valid input.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol.as_str(), self.object)?;
        if let Some(location) = &self.location {
            write!(f, "@{location}")?;
        }
        Ok(())
    }
}
