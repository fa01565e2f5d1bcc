// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Link header parsing
//
// WHIP servers advertise STUN/TURN servers as `Link` headers with
// `rel="ice-server"` (RFC 9725 Section 4.6), and protocol extensions as a
// comma-separated `Link` on the offer response.
//
// An entry is tokenized as `uri *( ";" param )` where the uri may be wrapped
// in angle brackets and params are `key=value` or `key:value` with optional
// quotes. Anything that does not fit is ignored rather than rejected.

use crate::config::IceServer;

const ICE_SERVER_REL: &str = "ice-server";

#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkEntry<'a> {
    uri: &'a str,
    params: Vec<(&'a str, &'a str)>,
}

impl<'a> LinkEntry<'a> {
    fn param(&self, key: &str) -> Option<&'a str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| *v)
    }

    fn has_rel(&self, rel: &str) -> bool {
        self.param("rel")
            .map(|value| value.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case(rel)))
            .unwrap_or(false)
    }
}

/// Splits on `;` outside of quotes and angle brackets.
fn split_segments(value: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut in_quotes = false;
    let mut in_brackets = false;
    let mut start = 0;

    for (i, c) in value.char_indices() {
        match c {
            '"' if !in_brackets => in_quotes = !in_quotes,
            '<' if !in_quotes => in_brackets = true,
            '>' if !in_quotes => in_brackets = false,
            ';' if !in_quotes && !in_brackets => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);
    segments
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

fn parse_param(segment: &str) -> Option<(&str, &str)> {
    let segment = segment.trim();
    let split = segment.find(['=', ':'])?;
    let key = segment[..split].trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some((key, unquote(&segment[split + 1..])))
}

fn tokenize(value: &str) -> Option<LinkEntry<'_>> {
    let mut segments = split_segments(value).into_iter();

    let raw_uri = segments.next()?.trim();
    let uri = match raw_uri.strip_prefix('<') {
        Some(rest) => rest.strip_suffix('>')?.trim(),
        None => raw_uri,
    };
    if uri.is_empty() || uri.contains(char::is_whitespace) {
        return None;
    }

    let params = segments.filter_map(parse_param).collect();
    Some(LinkEntry { uri, params })
}

/// Parses one `Link` header value into an ICE server descriptor.
///
/// Only `rel="ice-server"` entries with a `stun:` or `turn:` URI produce a
/// descriptor. `stun:` entries carry just the URL; `turn:` entries pick up
/// `username` and `credential` in whatever order they appear.
pub fn parse_ice_server(value: &str) -> Option<IceServer> {
    let entry = tokenize(value)?;
    if !entry.has_rel(ICE_SERVER_REL) {
        return None;
    }

    if entry.uri.starts_with("stun:") {
        Some(IceServer::new(entry.uri))
    } else if entry.uri.starts_with("turn:") {
        let mut server = IceServer::new(entry.uri);
        server.username = entry.param("username").map(str::to_owned);
        server.credential = entry.param("credential").map(str::to_owned);
        Some(server)
    } else {
        None
    }
}

/// Parses every `Link` header occurrence, preserving order and duplicates.
pub fn parse_ice_servers<'a, I>(values: I) -> Vec<IceServer>
where
    I: IntoIterator<Item = &'a str>,
{
    values.into_iter().filter_map(parse_ice_server).collect()
}

/// Splits the offer response `Link` header into extension entries.
pub fn parse_extensions(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim().to_owned())
        .collect()
}
