//! Header lists shared between executors and the upstream client.
//!
//! A plain vector (not a map) keeps insertion order, which matters for
//! signing-sensitive upstreams. Names written through `header_set` are
//! stored lowercase; lookups stay case-insensitive either way so header
//! maps copied verbatim from upstream responses behave too.

pub type Headers = Vec<(String, String)>;

/// Insert or replace, normalising the name to lowercase.
pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into().to_ascii_lowercase();
    let value = value.into();
    match headers
        .iter_mut()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
    {
        Some((_, slot)) => *slot = value,
        None => headers.push((name, value)),
    }
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let index = headers
        .iter()
        .position(|(existing, _)| existing.eq_ignore_ascii_case(name))?;
    Some(headers.remove(index).1)
}

/// Bearer-token authorization; every token-backed executor sets this.
pub fn set_bearer(headers: &mut Headers, token: &str) {
    header_set(headers, "authorization", format!("Bearer {token}"));
}
