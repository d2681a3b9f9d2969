// ABOUTME: Channel-0 management documents for BEEP channel negotiation
// ABOUTME: Parses and serializes the greeting/start/close/ok/error XML vocabulary

//! The management profile's document vocabulary.
//!
//! Channel 0 carries a closed XML vocabulary defined by RFC 3080 section
//! 2.3.1: `<greeting>`, `<start>`, `<close>`, `<ok/>`, `<error>` and the
//! `<profile>` element shared by greetings, start requests and start
//! replies. This is the only XML the engine understands; anything outside
//! the vocabulary is rejected so it can be answered with a 501 on the
//! wire.
//!
//! Management payloads are MIME entities like every other BEEP message.
//! Serializers emit a `Content-Type: application/beep+xml` header; the
//! parser strips any header block before looking for the document.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt;
use thiserror::Error;

/// MIME header block prefixed to every outbound management payload.
pub(crate) const BEEP_XML_HEADER: &str = "Content-Type: application/beep+xml\r\n\r\n";

/// Three-digit reply codes used in `<close>` and `<error>` documents.
///
/// The palette is RFC 3080 section 8; the engine itself only originates a
/// handful of them (200, 501, 550, 554) but will faithfully report any
/// listed code a peer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ReplyCode {
    Success = 200,
    ServiceNotAvailable = 421,
    ActionNotTaken = 450,
    ActionAborted = 451,
    TemporaryAuthFailure = 454,
    GeneralSyntaxError = 500,
    SyntaxErrorInParams = 501,
    ParameterNotImplemented = 504,
    AuthRequired = 530,
    AuthTooWeak = 534,
    AuthFailure = 535,
    ActionNotAuthorized = 537,
    AuthRequiresEncryption = 538,
    StillWorking = 550,
    ParameterInvalid = 553,
    TransactionFailed = 554,
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// Errors produced while decoding a management payload.
#[derive(Debug, Error)]
pub enum MgmtError {
    #[error("invalid XML: {0}")]
    Invalid(&'static str),

    #[error("element <{0}> is outside the management vocabulary")]
    UnknownElement(String),

    #[error("missing required attribute '{0}'")]
    MissingAttr(&'static str),

    #[error("bad value for attribute '{0}'")]
    BadAttr(&'static str),

    #[error("unknown reply code {0}")]
    UnknownCode(u32),
}

/// Payload transfer encoding advertised for a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    #[default]
    None,
    Base64,
}

/// One `<profile>` element inside a `<greeting>`.
#[derive(Debug, Clone, PartialEq)]
pub struct GreetingProfile {
    pub uri: String,
    pub encoding: PayloadEncoding,
}

/// The `<greeting>` each side sends as RPY 0 on channel 0.
///
/// `features` and `localize` are optional RFC 3080 attributes; the engine
/// stores them verbatim for the application and never emits its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Greeting {
    pub profiles: Vec<GreetingProfile>,
    pub features: Option<String>,
    pub localize: Option<String>,
}

/// One `<profile>` element inside a `<start>`, optionally carrying
/// piggybacked profile content.
#[derive(Debug, Clone, PartialEq)]
pub struct StartProfile {
    pub uri: String,
    pub encoding: PayloadEncoding,
    pub piggyback: Option<String>,
}

/// A `<start>` request.
#[derive(Debug, Clone, PartialEq)]
pub struct Start {
    pub number: u16,
    pub server_name: Option<String>,
    pub profiles: Vec<StartProfile>,
}

/// A `<close>` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Close {
    pub number: u16,
    pub code: ReplyCode,
}

/// The `<profile>` reply accepting a start request.
#[derive(Debug, Clone, PartialEq)]
pub struct StartAccept {
    pub uri: String,
    pub piggyback: Option<String>,
}

/// An `<error>` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorReply {
    pub code: ReplyCode,
    pub text: String,
}

/// A request document arriving as MSG on channel 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Start(Start),
    Close(Close),
}

/// A reply document arriving as RPY or ERR on channel 0.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Greeting(Greeting),
    Accept(StartAccept),
    Ok,
    Error(ErrorReply),
}

impl Request {
    pub fn parse(payload: &[u8]) -> Result<Request, MgmtError> {
        let element = parse_document(payload)?;
        match element.name.as_str() {
            "start" => Ok(Request::Start(parse_start(element)?)),
            "close" => Ok(Request::Close(parse_close(element)?)),
            other => Err(MgmtError::UnknownElement(other.to_owned())),
        }
    }

    /// Serializes the request with its MIME header block.
    pub fn to_payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(BEEP_XML_HEADER.as_bytes());
        match self {
            Request::Start(start) => {
                out.put_slice(b"<start number='");
                out.put_slice(start.number.to_string().as_bytes());
                out.put_slice(b"'");
                if let Some(name) = &start.server_name {
                    out.put_slice(b" serverName='");
                    put_escaped(&mut out, name);
                    out.put_slice(b"'");
                }
                out.put_slice(b">");
                for profile in &start.profiles {
                    out.put_slice(b"<profile uri='");
                    put_escaped(&mut out, &profile.uri);
                    out.put_slice(b"'");
                    if profile.encoding == PayloadEncoding::Base64 {
                        out.put_slice(b" encoding='base64'");
                    }
                    match &profile.piggyback {
                        Some(content) => {
                            out.put_slice(b">");
                            put_escaped(&mut out, content);
                            out.put_slice(b"</profile>");
                        }
                        None => out.put_slice(b" />"),
                    }
                }
                out.put_slice(b"</start>");
            }
            Request::Close(close) => {
                out.put_slice(b"<close number='");
                out.put_slice(close.number.to_string().as_bytes());
                out.put_slice(b"' code='");
                out.put_slice(close.code.to_string().as_bytes());
                out.put_slice(b"' />");
            }
        }
        out.freeze()
    }
}

impl Reply {
    pub fn parse(payload: &[u8]) -> Result<Reply, MgmtError> {
        let element = parse_document(payload)?;
        match element.name.as_str() {
            "greeting" => Ok(Reply::Greeting(parse_greeting(element)?)),
            "profile" => {
                let uri = element.require_attr("uri")?;
                let piggyback = element.text.filter(|t| !t.is_empty());
                Ok(Reply::Accept(StartAccept { uri, piggyback }))
            }
            "ok" => Ok(Reply::Ok),
            "error" => {
                let code = parse_code(&element)?;
                let text = element.text.unwrap_or_default();
                Ok(Reply::Error(ErrorReply { code, text }))
            }
            other => Err(MgmtError::UnknownElement(other.to_owned())),
        }
    }

    /// Serializes the reply with its MIME header block.
    pub fn to_payload(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.put_slice(BEEP_XML_HEADER.as_bytes());
        match self {
            Reply::Greeting(greeting) => {
                if greeting.profiles.is_empty() {
                    out.put_slice(b"<greeting />");
                } else {
                    out.put_slice(b"<greeting>");
                    for profile in &greeting.profiles {
                        out.put_slice(b"<profile uri='");
                        put_escaped(&mut out, &profile.uri);
                        out.put_slice(b"' />");
                    }
                    out.put_slice(b"</greeting>");
                }
            }
            Reply::Accept(accept) => {
                out.put_slice(b"<profile uri='");
                put_escaped(&mut out, &accept.uri);
                out.put_slice(b"'");
                match &accept.piggyback {
                    Some(content) => {
                        out.put_slice(b">");
                        put_escaped(&mut out, content);
                        out.put_slice(b"</profile>");
                    }
                    None => out.put_slice(b" />"),
                }
            }
            Reply::Ok => out.put_slice(b"<ok />"),
            Reply::Error(error) => {
                out.put_slice(b"<error code='");
                out.put_slice(error.code.to_string().as_bytes());
                if error.text.is_empty() {
                    out.put_slice(b"' />");
                } else {
                    out.put_slice(b"'>");
                    put_escaped(&mut out, &error.text);
                    out.put_slice(b"</error>");
                }
            }
        }
        out.freeze()
    }
}

fn parse_greeting(element: Element) -> Result<Greeting, MgmtError> {
    let features = element.attr("features");
    let localize = element.attr("localize");
    let mut profiles = Vec::with_capacity(element.children.len());
    for child in element.children {
        if child.name != "profile" {
            return Err(MgmtError::UnknownElement(child.name));
        }
        let encoding = parse_encoding(&child)?;
        profiles.push(GreetingProfile {
            uri: child.require_attr("uri")?,
            encoding,
        });
    }
    Ok(Greeting {
        profiles,
        features,
        localize,
    })
}

fn parse_start(element: Element) -> Result<Start, MgmtError> {
    let number = element
        .require_attr("number")?
        .parse::<u16>()
        .map_err(|_| MgmtError::BadAttr("number"))?;
    let server_name = element.attr("serverName");

    let mut profiles = Vec::with_capacity(element.children.len());
    for child in element.children {
        if child.name != "profile" {
            return Err(MgmtError::UnknownElement(child.name));
        }
        let encoding = parse_encoding(&child)?;
        profiles.push(StartProfile {
            uri: child.require_attr("uri")?,
            encoding,
            piggyback: child.text.filter(|t| !t.is_empty()),
        });
    }
    if profiles.is_empty() {
        return Err(MgmtError::Invalid("start without profile"));
    }
    Ok(Start {
        number,
        server_name,
        profiles,
    })
}

fn parse_close(element: Element) -> Result<Close, MgmtError> {
    if !element.children.is_empty() {
        return Err(MgmtError::Invalid("close must be empty"));
    }
    let number = element
        .require_attr("number")?
        .parse::<u16>()
        .map_err(|_| MgmtError::BadAttr("number"))?;
    Ok(Close {
        number,
        code: parse_code(&element)?,
    })
}

fn parse_code(element: &Element) -> Result<ReplyCode, MgmtError> {
    let raw = element
        .attr("code")
        .ok_or(MgmtError::MissingAttr("code"))?
        .parse::<u32>()
        .map_err(|_| MgmtError::BadAttr("code"))?;
    ReplyCode::try_from(raw).map_err(|_| MgmtError::UnknownCode(raw))
}

fn parse_encoding(element: &Element) -> Result<PayloadEncoding, MgmtError> {
    match element.attr("encoding").as_deref() {
        None | Some("none") => Ok(PayloadEncoding::None),
        Some("base64") => Ok(PayloadEncoding::Base64),
        Some(_) => Err(MgmtError::BadAttr("encoding")),
    }
}

fn put_escaped(out: &mut BytesMut, text: &str) {
    for ch in text.chars() {
        match ch {
            '<' => out.put_slice(b"&lt;"),
            '>' => out.put_slice(b"&gt;"),
            '&' => out.put_slice(b"&amp;"),
            '\'' => out.put_slice(b"&apos;"),
            '"' => out.put_slice(b"&quot;"),
            other => {
                let mut buf = [0u8; 4];
                out.put_slice(other.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}

/// A parsed XML element. The vocabulary is flat enough that "children or
/// text, one level deep" covers every legal document.
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Element>,
    text: Option<String>,
}

impl Element {
    fn attr(&self, name: &str) -> Option<String> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
    }

    fn require_attr(&self, name: &'static str) -> Result<String, MgmtError> {
        self.attr(name).ok_or(MgmtError::MissingAttr(name))
    }
}

/// Strips a leading MIME header block (terminated by a blank line) if one
/// is present. A payload that starts directly with `<` has the bare empty
/// separator or none at all.
fn strip_mime_headers(payload: &[u8]) -> &[u8] {
    let mut rest = payload;
    loop {
        match rest.first() {
            Some(b'\r') if rest.get(1) == Some(&b'\n') => return &rest[2..],
            Some(b'<') | None => return rest,
            _ => match rest.windows(2).position(|w| w == b"\r\n") {
                Some(i) => rest = &rest[i + 2..],
                None => return rest,
            },
        }
    }
}

fn parse_document(payload: &[u8]) -> Result<Element, MgmtError> {
    let body = strip_mime_headers(payload);
    let text = std::str::from_utf8(body).map_err(|_| MgmtError::Invalid("not UTF-8"))?;
    let mut parser = Parser {
        rest: text.trim_ascii(),
    };
    let element = parser.element()?;
    if !parser.rest.trim_ascii().is_empty() {
        return Err(MgmtError::Invalid("trailing content after document"));
    }
    Ok(element)
}

/// A recursive-descent parser for exactly the subset of XML the
/// management vocabulary needs: elements, single-quoted or double-quoted
/// attributes, character data and the five predefined entities. No
/// prolog, comments, CDATA or namespaces.
struct Parser<'a> {
    rest: &'a str,
}

impl<'a> Parser<'a> {
    fn element(&mut self) -> Result<Element, MgmtError> {
        self.expect('<')?;
        let name = self.name()?;
        let attrs = self.attributes()?;

        if self.eat("/>") {
            return Ok(Element {
                name,
                attrs,
                children: Vec::new(),
                text: None,
            });
        }
        self.expect('>')?;

        let mut children = Vec::new();
        let mut text = String::new();
        loop {
            if self.rest.starts_with("</") {
                self.rest = &self.rest[2..];
                let closing = self.name()?;
                if closing != name {
                    return Err(MgmtError::Invalid("mismatched closing tag"));
                }
                self.skip_space();
                self.expect('>')?;
                break;
            }
            if self.rest.starts_with('<') {
                children.push(self.element()?);
            } else if self.rest.is_empty() {
                return Err(MgmtError::Invalid("unterminated element"));
            } else {
                let chunk_end = self.rest.find('<').unwrap_or(self.rest.len());
                text.push_str(&unescape(&self.rest[..chunk_end])?);
                self.rest = &self.rest[chunk_end..];
            }
        }

        let trimmed = text.trim_ascii().to_owned();
        Ok(Element {
            name,
            attrs,
            children,
            text: if trimmed.is_empty() {
                None
            } else {
                Some(trimmed)
            },
        })
    }

    fn attributes(&mut self) -> Result<Vec<(String, String)>, MgmtError> {
        let mut attrs = Vec::new();
        loop {
            self.skip_space();
            let next = self.rest.chars().next();
            if matches!(next, Some('>') | Some('/')) {
                return Ok(attrs);
            }
            let name = self.name()?;
            self.skip_space();
            self.expect('=')?;
            self.skip_space();
            let quote = match self.rest.chars().next() {
                Some(q @ ('\'' | '"')) => q,
                _ => return Err(MgmtError::Invalid("unquoted attribute value")),
            };
            self.rest = &self.rest[1..];
            let end = self
                .rest
                .find(quote)
                .ok_or(MgmtError::Invalid("unterminated attribute value"))?;
            let value = unescape(&self.rest[..end])?;
            self.rest = &self.rest[end + 1..];
            attrs.push((name, value));
        }
    }

    fn name(&mut self) -> Result<String, MgmtError> {
        let end = self
            .rest
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(self.rest.len());
        if end == 0 {
            return Err(MgmtError::Invalid("expected a name"));
        }
        let name = self.rest[..end].to_owned();
        self.rest = &self.rest[end..];
        Ok(name)
    }

    fn skip_space(&mut self) {
        self.rest = self.rest.trim_ascii_start();
    }

    fn expect(&mut self, ch: char) -> Result<(), MgmtError> {
        if self.rest.starts_with(ch) {
            self.rest = &self.rest[ch.len_utf8()..];
            Ok(())
        } else {
            Err(MgmtError::Invalid("unexpected character"))
        }
    }

    fn eat(&mut self, prefix: &str) -> bool {
        if self.rest.starts_with(prefix) {
            self.rest = &self.rest[prefix.len()..];
            true
        } else {
            false
        }
    }
}

fn unescape(text: &str) -> Result<String, MgmtError> {
    if !text.contains('&') {
        return Ok(text.to_owned());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        let end = rest
            .find(';')
            .ok_or(MgmtError::Invalid("unterminated entity"))?;
        match &rest[..end + 1] {
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&amp;" => out.push('&'),
            "&apos;" => out.push('\''),
            "&quot;" => out.push('"'),
            _ => return Err(MgmtError::Invalid("unknown entity")),
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_roundtrip() {
        let greeting = Greeting {
            profiles: vec![
                GreetingProfile {
                    uri: "urn:example:echo".into(),
                    encoding: PayloadEncoding::None,
                },
                GreetingProfile {
                    uri: "urn:example:sink".into(),
                    encoding: PayloadEncoding::None,
                },
            ],
            features: None,
            localize: None,
        };
        let payload = Reply::Greeting(greeting.clone()).to_payload();
        assert_eq!(Reply::parse(&payload).unwrap(), Reply::Greeting(greeting));
    }

    #[test]
    fn empty_greeting_parses() {
        let reply = Reply::parse(b"\r\n<greeting />").unwrap();
        assert_eq!(reply, Reply::Greeting(Greeting::default()));
    }

    #[test]
    fn greeting_extra_attributes_kept() {
        let reply =
            Reply::parse(b"\r\n<greeting features='jumbo' localize='en-US'></greeting>").unwrap();
        match reply {
            Reply::Greeting(g) => {
                assert_eq!(g.features.as_deref(), Some("jumbo"));
                assert_eq!(g.localize.as_deref(), Some("en-US"));
            }
            other => panic!("expected greeting, got {other:?}"),
        }
    }

    #[test]
    fn start_roundtrip_with_piggyback() {
        let start = Start {
            number: 7,
            server_name: Some("beep.example.com".into()),
            profiles: vec![StartProfile {
                uri: "urn:example:echo".into(),
                encoding: PayloadEncoding::None,
                piggyback: Some("<boot/>".into()),
            }],
        };
        let payload = Request::Start(start.clone()).to_payload();
        assert_eq!(Request::parse(&payload).unwrap(), Request::Start(start));
    }

    #[test]
    fn start_without_profiles_rejected() {
        let result = Request::parse(b"\r\n<start number='3'></start>");
        assert!(matches!(result, Err(MgmtError::Invalid(_))));
    }

    #[test]
    fn close_roundtrip() {
        let close = Close {
            number: 5,
            code: ReplyCode::Success,
        };
        let payload = Request::Close(close).to_payload();
        assert_eq!(Request::parse(&payload).unwrap(), Request::Close(close));
    }

    #[test]
    fn error_reply_roundtrip() {
        let error = ErrorReply {
            code: ReplyCode::TransactionFailed,
            text: "profile not supported".into(),
        };
        let payload = Reply::Error(error.clone()).to_payload();
        assert_eq!(Reply::parse(&payload).unwrap(), Reply::Error(error));
    }

    #[test]
    fn mime_headers_are_stripped() {
        let payload = b"Content-Type: application/beep+xml\r\nX-Extra: 1\r\n\r\n<ok />";
        assert_eq!(Reply::parse(payload).unwrap(), Reply::Ok);
    }

    #[test]
    fn double_quoted_attributes_accepted() {
        let request = Request::parse(b"\r\n<start number=\"9\"><profile uri=\"x\"/></start>");
        match request.unwrap() {
            Request::Start(s) => {
                assert_eq!(s.number, 9);
                assert_eq!(s.profiles[0].uri, "x");
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn vocabulary_is_closed() {
        let result = Request::parse(b"\r\n<tuning><profile uri='x'/></tuning>");
        assert!(matches!(result, Err(MgmtError::UnknownElement(_))));
    }

    #[test]
    fn unknown_reply_code_rejected() {
        let result = Reply::parse(b"\r\n<error code='299'>eh</error>");
        assert!(matches!(result, Err(MgmtError::UnknownCode(299))));
    }

    #[test]
    fn entities_unescaped_in_text() {
        let reply = Reply::parse(b"\r\n<error code='500'>a &lt;b&gt; &amp; c</error>").unwrap();
        match reply {
            Reply::Error(e) => assert_eq!(e.text, "a <b> & c"),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn trailing_garbage_rejected() {
        let result = Reply::parse(b"\r\n<ok /><ok />");
        assert!(matches!(result, Err(MgmtError::Invalid(_))));
    }

    #[test]
    fn reply_code_numeric_conversions() {
        assert_eq!(u32::from(ReplyCode::StillWorking), 550);
        assert_eq!(ReplyCode::try_from(421).unwrap(), ReplyCode::ServiceNotAvailable);
        assert!(ReplyCode::try_from(600).is_err());
    }
}
