//! Header fields of a request or response
//!
//! Names compare without regard to ASCII case. Fields keep the order they
//! were read or added in, which is also the order they go back on the wire,
//! and a name may repeat (`Set-Cookie` does).

use super::{Error, Result, MAX_HEADERS};
use std::fmt;

/// Ordered field lines of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

fn same_name(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field after the existing ones, keeping earlier values of the
    /// same name.
    ///
    /// Fields past `MAX_HEADERS` are dropped.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.fields.len() >= MAX_HEADERS {
            log::debug!("Dropping header beyond the {} field limit", MAX_HEADERS);
            return;
        }
        self.fields.push((name.into(), value.into()));
    }

    /// Leave exactly one field named `name`, holding `value`.
    ///
    /// The surviving field sits where the first match was; without a match
    /// the field is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let Some(first) = self.fields.iter().position(|(n, _)| same_name(n, &name)) else {
            self.insert(name, value);
            return;
        };

        self.fields[first].1 = value.into();
        let mut index = 0;
        self.fields.retain(|(n, _)| {
            let keep = index <= first || !same_name(n, &name);
            index += 1;
            keep
        });
    }

    /// Value of the first field named `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values(name).next()
    }

    /// Values of every field named `name`, in message order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.values(name).collect()
    }

    fn values<'a: 'b, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + 'b {
        self.fields
            .iter()
            .filter(move |(n, _)| same_name(n, name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether any `name` field lists `token` in its comma-separated value,
    /// as `Connection: keep-alive, Upgrade` lists `upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.values(name)
            .flat_map(|value| value.split(','))
            .any(|t| same_name(t.trim(), token))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values(name).next().is_some()
    }

    /// Drop every field named `name`, returning how many went.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(n, _)| !same_name(n, name));
        before - self.fields.len()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Split one `Name: value` line, trimming both halves.
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHeader(format!("missing ':' in {:?}", line)))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidHeader(format!("no field name in {:?}", line)));
        }
        Ok((name.to_string(), value.trim().to_string()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fields
            .iter()
            .try_for_each(|(name, value)| writeln!(f, "{}: {}", name, value))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        iter.into_iter()
            .for_each(|(name, value)| headers.insert(name, value));
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_headers() -> Headers {
        [
            ("Content-Type", "text/html"),
            ("Set-Cookie", "sid=abc; Path=/"),
            ("Connection", "keep-alive, Upgrade"),
            ("set-cookie", "theme=dark"),
        ]
        .into_iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn test_lookup_ignores_case() {
        let headers = response_headers();
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(headers.contains("connection"));
        assert_eq!(headers.get("Location"), None);
    }

    #[test]
    fn test_repeated_names_keep_order() {
        let headers = response_headers();
        assert_eq!(
            headers.get_all("Set-Cookie"),
            vec!["sid=abc; Path=/", "theme=dark"]
        );
        assert_eq!(headers.get("set-cookie"), Some("sid=abc; Path=/"));
    }

    #[test]
    fn test_set_collapses_to_first_position() {
        let mut headers = Headers::new();
        headers.insert("Host", "a.test");
        headers.insert("Cookie", "x=1");
        headers.insert("Accept", "*/*");
        headers.insert("cookie", "y=2");

        headers.set("Cookie", "x=1; y=2");
        let fields: Vec<_> = headers.iter().collect();
        assert_eq!(
            fields,
            vec![("Host", "a.test"), ("Cookie", "x=1; y=2"), ("Accept", "*/*")]
        );

        headers.set("User-Agent", "httpsend");
        assert_eq!(headers.iter().last(), Some(("User-Agent", "httpsend")));
    }

    #[test]
    fn test_connection_tokens() {
        let headers = response_headers();
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("Connection", "KEEP-ALIVE"));
        assert!(!headers.has_token("connection", "close"));
        assert!(!headers.has_token("Transfer-Encoding", "chunked"));
    }

    #[test]
    fn test_remove_counts_fields() {
        let mut headers = response_headers();
        assert_eq!(headers.remove("SET-COOKIE"), 2);
        assert_eq!(headers.remove("Set-Cookie"), 0);
        assert_eq!(headers.len(), 2);
    }

    #[test]
    fn test_display_is_one_line_per_field() {
        let mut headers = Headers::new();
        headers.insert("Location", "/next");
        headers.insert("Content-Length", "0");
        assert_eq!(headers.to_string(), "Location: /next\nContent-Length: 0\n");
    }

    #[test]
    fn test_parse_header_line() {
        assert_eq!(
            Headers::parse_header_line("Location:  http://a.test/x:1  ").unwrap(),
            ("Location".to_string(), "http://a.test/x:1".to_string())
        );
        assert!(Headers::parse_header_line("no colon here").is_err());
        assert!(Headers::parse_header_line("  : orphan").is_err());
    }

    #[test]
    fn test_field_limit() {
        let mut headers = Headers::new();
        (0..MAX_HEADERS + 3).for_each(|i| headers.insert(format!("X-Field-{}", i), "v"));
        assert_eq!(headers.len(), MAX_HEADERS);
    }
}
