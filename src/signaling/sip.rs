//! SIP message model: parse and serialize requests and responses.
//!
//! Only what the user agent needs: start line, ordered headers with compact
//! form expansion, a text body, and helpers for the tag/branch parameters and
//! name-addr values that dialogs are built from.

use std::fmt;

use anyhow::{bail, Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, uri: String },
    Response { code: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessage {
    pub start: StartLine,
    headers: Vec<(String, String)>,
    pub body: String,
}

fn expand_compact(name: &str) -> &str {
    match name {
        "v" | "V" => "Via",
        "f" | "F" => "From",
        "t" | "T" => "To",
        "i" | "I" => "Call-ID",
        "m" | "M" => "Contact",
        "l" | "L" => "Content-Length",
        "c" | "C" => "Content-Type",
        "r" | "R" => "Refer-To",
        "k" | "K" => "Supported",
        "o" | "O" => "Event",
        _ => name,
    }
}

impl SipMessage {
    pub fn request(method: &str, uri: impl Into<String>) -> Self {
        Self {
            start: StartLine::Request {
                method: method.to_string(),
                uri: uri.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn response(code: u16, reason: impl Into<String>) -> Self {
        Self {
            start: StartLine::Response {
                code,
                reason: reason.into(),
            },
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Build a response to `req`, copying the headers RFC 3261 §8.2.6 requires.
    /// `to_tag` is added to the To header when it does not carry one yet.
    pub fn response_to(req: &SipMessage, code: u16, reason: &str, to_tag: Option<&str>) -> Self {
        let mut resp = Self::response(code, reason);
        for via in req.header_all("Via") {
            resp.add_header("Via", via);
        }
        for name in ["From", "Call-ID", "CSeq"] {
            if let Some(v) = req.header(name) {
                resp.add_header(name, v);
            }
        }
        if let Some(to) = req.header("To") {
            match to_tag {
                Some(tag) if header_param(to, "tag").is_none() => {
                    resp.add_header("To", &format!("{};tag={}", to, tag))
                }
                _ => resp.add_header("To", to),
            }
        }
        resp
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn uri(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Response { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    pub fn reason(&self) -> &str {
        match &self.start {
            StartLine::Response { reason, .. } => reason,
            StartLine::Request { .. } => "",
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// First value of a header, matched case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.add_header(name, value);
    }

    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn set_body(&mut self, content_type: &str, body: impl Into<String>) {
        self.set_header("Content-Type", content_type);
        self.body = body.into();
    }

    pub fn call_id(&self) -> Option<&str> {
        self.header("Call-ID")
    }

    /// CSeq number and method.
    pub fn cseq(&self) -> Option<(u32, &str)> {
        let v = self.header("CSeq")?;
        let mut parts = v.split_whitespace();
        let num = parts.next()?.parse().ok()?;
        let method = parts.next()?;
        Some((num, method))
    }

    /// Branch parameter of the top Via.
    pub fn branch(&self) -> Option<&str> {
        header_param(self.header("Via")?, "branch")
    }

    pub fn from_tag(&self) -> Option<&str> {
        header_param(self.header("From")?, "tag")
    }

    pub fn to_tag(&self) -> Option<&str> {
        header_param(self.header("To")?, "tag")
    }

    /// Parse one message from a WebSocket text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let (head, body) = match text.find("\r\n\r\n") {
            Some(pos) => (&text[..pos], &text[pos + 4..]),
            None => (text.trim_end(), ""),
        };
        let mut lines = head.split("\r\n");
        let first = lines.next().context("Empty SIP message")?;

        let start = if let Some(rest) = first.strip_prefix("SIP/2.0 ") {
            let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
            StartLine::Response {
                code: code
                    .parse()
                    .with_context(|| format!("Bad status line: {}", first))?,
                reason: reason.to_string(),
            }
        } else {
            let mut parts = first.split(' ');
            let (Some(method), Some(uri), Some("SIP/2.0")) = (parts.next(), parts.next(), parts.next())
            else {
                bail!("Bad request line: {}", first);
            };
            StartLine::Request {
                method: method.to_string(),
                uri: uri.to_string(),
            }
        };

        let mut headers: Vec<(String, String)> = Vec::new();
        for line in lines {
            if line.starts_with(' ') || line.starts_with('\t') {
                // Folded continuation of the previous header.
                if let Some((_, v)) = headers.last_mut() {
                    v.push(' ');
                    v.push_str(line.trim());
                }
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .with_context(|| format!("Bad header line: {}", line))?;
            let name = expand_compact(name.trim()).to_string();
            let value = value.trim();
            // Via and Contact may carry several comma-separated values.
            if name.eq_ignore_ascii_case("Via") {
                for v in value.split(',') {
                    headers.push((name.clone(), v.trim().to_string()));
                }
            } else {
                headers.push((name, value.to_string()));
            }
        }

        let body = match headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
        {
            // Content-Length counts bytes; a cut inside a character keeps the whole body.
            Some(len) => body.get(..len).unwrap_or(body).to_string(),
            None => body.to_string(),
        };

        Ok(Self {
            start,
            headers,
            body,
        })
    }
}

impl fmt::Display for SipMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.start {
            StartLine::Request { method, uri } => write!(f, "{} {} SIP/2.0\r\n", method, uri)?,
            StartLine::Response { code, reason } => write!(f, "SIP/2.0 {} {}\r\n", code, reason)?,
        }
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "Content-Length: {}\r\n\r\n{}", self.body.len(), self.body)
    }
}

/// Value of a `;name=value` parameter in a header, outside any `<...>`.
pub fn header_param<'a>(value: &'a str, name: &str) -> Option<&'a str> {
    let params = match value.rfind('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    params.split(';').skip(1).find_map(|p| {
        let (k, v) = p.split_once('=').unwrap_or((p, ""));
        k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// A `"Display" <uri>` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
}

impl NameAddr {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let (Some(lt), Some(gt)) = (value.find('<'), value.find('>')) {
            if gt < lt {
                return None;
            }
            let display = value[..lt].trim().trim_matches('"').trim();
            return Some(Self {
                display_name: (!display.is_empty()).then(|| display.to_string()),
                uri: value[lt + 1..gt].to_string(),
            });
        }
        // addr-spec form: parameters belong to the header, not the URI.
        let uri = value.split(';').next()?.trim();
        (!uri.is_empty()).then(|| Self {
            display_name: None,
            uri: uri.to_string(),
        })
    }

    /// User part of the URI (`sip:user@host` → `user`).
    pub fn user(&self) -> Option<&str> {
        let rest = self
            .uri
            .strip_prefix("sip:")
            .or_else(|| self.uri.strip_prefix("sips:"))
            .or_else(|| self.uri.strip_prefix("tel:"))?;
        let user = rest.split(['@', ';', '?']).next()?;
        (!user.is_empty()).then_some(user)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "\"{}\" <{}>", name.replace('"', ""), self.uri),
            None => write!(f, "<{}>", self.uri),
        }
    }
}

pub fn new_branch() -> String {
    format!("z9hG4bK{}", uuid::Uuid::new_v4().simple())
}

pub fn new_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..10].to_string()
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        183 => "Session Progress",
        200 => "OK",
        202 => "Accepted",
        401 => "Unauthorized",
        404 => "Not Found",
        407 => "Proxy Authentication Required",
        480 => "Temporarily Unavailable",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        488 => "Not Acceptable Here",
        501 => "Not Implemented",
        603 => "Decline",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:1001@pbx.example.com SIP/2.0\r\n\
v: SIP/2.0/WSS proxy.example.com;branch=z9hG4bKabc, SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKdef\r\n\
From: \"Ada Lovelace\" <sip:5551234567@pbx.example.com>;tag=from1\r\n\
To: <sip:1001@pbx.example.com>\r\n\
i: call-123\r\n\
CSeq: 102 INVITE\r\n\
Contact: <sip:5551234567@10.0.0.1:5060>\r\n\
Content-Type: application/sdp\r\n\
l: 9\r\n\
\r\n\
v=0\r\ns=x";

    #[test]
    fn test_parse_request_with_compact_headers() {
        let msg = SipMessage::parse(INVITE).unwrap();
        assert_eq!(msg.method(), Some("INVITE"));
        assert_eq!(msg.call_id(), Some("call-123"));
        assert_eq!(msg.cseq(), Some((102, "INVITE")));
        assert_eq!(msg.branch(), Some("z9hG4bKabc"));
        assert_eq!(msg.header_all("Via").count(), 2);
        assert_eq!(msg.from_tag(), Some("from1"));
        assert_eq!(msg.to_tag(), None);
        assert_eq!(msg.body, "v=0\r\ns=x");
    }

    #[test]
    fn test_response_to_copies_dialog_headers() {
        let req = SipMessage::parse(INVITE).unwrap();
        let resp = SipMessage::response_to(&req, 180, "Ringing", Some("local9"));
        let text = resp.to_string();
        let parsed = SipMessage::parse(&text).unwrap();

        assert_eq!(parsed.status(), Some(180));
        assert_eq!(parsed.to_tag(), Some("local9"));
        assert_eq!(parsed.from_tag(), Some("from1"));
        assert_eq!(parsed.header_all("Via").count(), 2);
        assert_eq!(parsed.cseq(), Some((102, "INVITE")));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_content_length_inside_multibyte_char() {
        let text = "NOTIFY sip:1001@pbx.example.com SIP/2.0\r\n\
Call-ID: n1\r\n\
CSeq: 1 NOTIFY\r\n\
Content-Length: 1\r\n\
\r\n\
\u{e9}";
        let msg = SipMessage::parse(text).unwrap();
        assert_eq!(msg.body, "\u{e9}");

        let long = text.replace("Content-Length: 1", "Content-Length: 5");
        assert_eq!(SipMessage::parse(&long).unwrap().body, "\u{e9}");
    }

    #[test]
    fn test_header_lookup_with_owned_name() {
        let msg = SipMessage::parse(INVITE).unwrap();
        let call_id = {
            let name = String::from("call-id");
            msg.header(&name)
        };
        assert!(call_id.is_some());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SipMessage::parse("hello world").is_err());
        assert!(SipMessage::parse("SIP/2.0 abc OK\r\n\r\n").is_err());
    }

    #[test]
    fn test_name_addr_forms() {
        let na = NameAddr::parse("\"Ada Lovelace\" <sip:5551234567@pbx;user=phone>;tag=x").unwrap();
        assert_eq!(na.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(na.user(), Some("5551234567"));

        let bare = NameAddr::parse("sip:1001@pbx.example.com;tag=abc").unwrap();
        assert_eq!(bare.uri, "sip:1001@pbx.example.com");
        assert_eq!(bare.display_name, None);

        let tel = NameAddr::parse("<tel:+15550100>").unwrap();
        assert_eq!(tel.user(), Some("+15550100"));
    }

    #[test]
    fn test_header_param_ignores_uri_params() {
        let v = "<sip:a@b;tag=inner>;tag=outer";
        assert_eq!(header_param(v, "tag"), Some("outer"));
        assert_eq!(header_param("SIP/2.0/WSS x.invalid;rport;branch=z9hG4bK1", "branch"), Some("z9hG4bK1"));
        assert_eq!(header_param("SIP/2.0/WSS x.invalid;rport", "rport"), Some(""));
    }
}
