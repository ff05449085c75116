//! # Message headers
//!
//! Module dedicated to the header block of rendered messages: parsing
//! (with unfolding), recipients extraction and conversion of values
//! to their encoded form.

use mail_builder::headers::{address as builder, raw::Raw, text::Text, HeaderType};
use mail_parser::{Addr, Address, MessageParser};

use super::{BCC, CC, TO};

/// A single header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

/// An ordered list of headers.
///
/// Names are compared case-insensitively, and the same header can
/// appear multiple times.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Headers {
    entries: Vec<Header>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the value of the first header matching the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Return the values of all headers matching the given name, in
    /// order of appearance.
    ///
    /// The returned values only borrow the headers, not the name.
    pub fn get_all(&self, name: &str) -> impl Iterator<Item = &str> + '_ {
        let name = name.to_owned();
        self.entries
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(&name))
            .map(|h| h.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn push(&mut self, name: impl ToString, value: impl ToString) {
        self.entries.push(Header {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove all headers matching the given name, and return their
    /// values.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();

        self.entries.retain(|h| {
            if h.name.eq_ignore_ascii_case(name) {
                removed.push(h.value.clone());
                false
            } else {
                true
            }
        });

        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

/// Split the given LF-terminated text into its header block and its
/// body.
///
/// Continuation lines are unfolded. The header block ends at the
/// first blank line, which is consumed, or at the first line that is
/// not a header, which is kept as the first line of the body.
pub fn parse_block(text: &str) -> (Headers, &str) {
    let mut headers = Headers::new();
    let mut rest = text;

    loop {
        if rest.is_empty() {
            return (headers, rest);
        }

        let (line, next) = match rest.find('\n') {
            Some(i) => (&rest[..i], &rest[i + 1..]),
            None => (rest, ""),
        };

        if line.is_empty() {
            return (headers, next);
        }

        if line.starts_with([' ', '\t']) {
            match headers.entries.last_mut() {
                Some(header) => {
                    header.value.push(' ');
                    header.value.push_str(line.trim());
                    rest = next;
                    continue;
                }
                None => return (headers, rest),
            }
        }

        match line.split_once(':') {
            Some((name, value)) if is_header_name(name) => {
                headers.push(name, value.trim());
                rest = next;
            }
            _ => return (headers, rest),
        }
    }
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| (33..=126).contains(&b))
}

/// Parse the given address list header value into bare addresses.
///
/// Both `"Display Name" <addr>` and bare `addr` entries are
/// supported, as well as RFC 2822 groups.
pub fn parse_addresses(value: &str) -> Vec<String> {
    let raw = format!("To: {value}\r\n\r\n");

    let Some(msg) = MessageParser::new().parse(raw.as_bytes()) else {
        return Vec::new();
    };

    match msg.to() {
        Some(Address::List(addrs)) => collect_emails(addrs),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|group| collect_emails(&group.addresses))
            .collect(),
        None => Vec::new(),
    }
}

fn collect_emails(addrs: &[Addr]) -> Vec<String> {
    addrs
        .iter()
        .filter_map(|addr| addr.address.as_ref())
        .map(|email| email.trim().to_owned())
        .filter(|email| !email.is_empty())
        .collect()
}

/// Collect the recipients of the given headers: all TO addresses,
/// then all CC, then all BCC.
pub fn collect_recipients(headers: &Headers) -> Vec<String> {
    [TO, CC, BCC]
        .into_iter()
        .flat_map(|name| headers.get_all(name))
        .flat_map(parse_addresses)
        .collect()
}

/// Build the serializable value of the given header.
///
/// ASCII values are kept as written. Non-ASCII address headers keep
/// their addresses readable, only display names are encoded. Other
/// non-ASCII values are encoded as a whole.
pub(crate) fn to_builder_value<'a>(name: &str, value: &'a str) -> HeaderType<'a> {
    if value.is_ascii() {
        return Raw::new(value).into();
    }

    if is_address_header(name) {
        if let Some(addr) = to_builder_address(value) {
            return addr.into();
        }
    }

    Text::new(value).into()
}

fn is_address_header(name: &str) -> bool {
    ["From", "To", "Cc", "Bcc", "Reply-To", "Sender"]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn to_builder_address(value: &str) -> Option<builder::Address<'static>> {
    let raw = format!("To: {value}\r\n\r\n");
    let msg = MessageParser::new().parse(raw.as_bytes())?;

    let addr = match msg.to()? {
        Address::List(addrs) => builder::Address::new_list(to_builder_addrs(addrs)),
        Address::Group(groups) => builder::Address::new_list(
            groups
                .iter()
                .map(|group| {
                    let name = group.name.as_ref().map(ToString::to_string);
                    builder::Address::new_group(name, to_builder_addrs(&group.addresses))
                })
                .collect(),
        ),
    };

    Some(addr)
}

fn to_builder_addrs(addrs: &[Addr]) -> Vec<builder::Address<'static>> {
    addrs
        .iter()
        .filter_map(|addr| {
            let email = addr.address.as_ref()?.to_string();
            let name = addr.name.as_ref().map(ToString::to_string);
            Some(builder::Address::new_address(name, email))
        })
        .collect()
}
