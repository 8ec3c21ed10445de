use std::fmt;

/// One `proto+host+port [timeout=send,close,connect]` endpoint token from
/// the service list file or a proxy string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub proto: String,
    pub host: String,
    pub port: u16,
    pub timeout_msec: u32,
    pub close_timeout_msec: u32,
    pub connect_timeout_msec: u32,
}

impl Endpoint {
    pub fn parse(token: &str) -> crate::Result<Self> {
        let token = token.trim();
        let (addr, opts) = match token.split_once(char::is_whitespace) {
            Some((addr, rest)) => (addr, rest.trim()),
            None => (token, ""),
        };

        let mut parts = addr.split('+');
        let proto = parts.next().unwrap_or("");
        let host = parts.next().unwrap_or("");
        let port = parts.next().unwrap_or("");
        if proto.is_empty() || host.is_empty() || parts.next().is_some() {
            return Err(crate::Error::InvalidEndpoint(token.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| crate::Error::InvalidEndpoint(token.to_string()))?;

        let mut ep = Endpoint {
            proto: proto.to_string(),
            host: host.to_string(),
            port,
            timeout_msec: 0,
            close_timeout_msec: 0,
            connect_timeout_msec: 0,
        };

        for opt in opts.split_whitespace() {
            if let Some(spec) = opt.strip_prefix("timeout=") {
                let mut it = spec.split(',').map(|s| s.parse::<u32>().unwrap_or(0));
                ep.timeout_msec = it.next().unwrap_or(0);
                ep.close_timeout_msec = it.next().unwrap_or(0);
                ep.connect_timeout_msec = it.next().unwrap_or(0);
            }
        }
        Ok(ep)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn has_timeouts(&self) -> bool {
        self.timeout_msec > 0 || self.close_timeout_msec > 0 || self.connect_timeout_msec > 0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}", self.proto, self.host, self.port)?;
        if self.has_timeouts() {
            write!(
                f,
                " timeout={},{},{}",
                self.timeout_msec, self.close_timeout_msec, self.connect_timeout_msec
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let ep = Endpoint::parse("tcp+10.0.0.1+3030").unwrap();
        assert_eq!((ep.proto.as_str(), ep.host.as_str(), ep.port), ("tcp", "10.0.0.1", 3030));
        assert_eq!(ep.to_string(), "tcp+10.0.0.1+3030");

        let ep = Endpoint::parse("tcp+svc.internal+9000 timeout=7000,0,2000").unwrap();
        assert_eq!(ep.timeout_msec, 7000);
        assert_eq!(ep.connect_timeout_msec, 2000);
        assert_eq!(ep.to_string(), "tcp+svc.internal+9000 timeout=7000,0,2000");

        assert!(Endpoint::parse("tcp+host").is_err());
        assert!(Endpoint::parse("tcp+host+nope").is_err());
    }
}
