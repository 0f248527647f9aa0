/// An ordered list of HTTP header fields.
///
/// Lookups are case-insensitive, as HTTP requires, but the original casing and
/// order of every field is kept so a request can be forwarded exactly as it
/// arrived. Repeated fields are stored as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value for `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Appends a field without touching existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every existing `name` field with a single one.
    ///
    /// The new field takes the position of the first replaced field, or goes
    /// last if there was none.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(&name)) {
            Some(first) => {
                self.entries[first] = (name.clone(), value);
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || !k.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Removes every `name` field. Returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when any comma-separated token of a `name` field equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_ignore_case() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "application/json");

        assert_eq!(headers.get("content-type"), Some("application/json"));
        assert!(headers.contains("CONTENT-TYPE"));
    }

    #[test]
    fn set_collapses_duplicates_in_place() {
        let mut headers: Headers = [("A", "1"), ("X-Test", "a"), ("B", "2"), ("x-test", "b")]
            .into_iter()
            .collect();

        headers.set("X-Test", "c");

        let fields: Vec<_> = headers.iter().collect();
        assert_eq!(fields, vec![("A", "1"), ("X-Test", "c"), ("B", "2")]);
    }

    #[test]
    fn remove_drops_every_instance() {
        let mut headers: Headers = [("X-Forwarded-For", "1.2.3.4"), ("x-forwarded-for", "5.6.7.8")]
            .into_iter()
            .collect();

        assert_eq!(headers.remove("X-FORWARDED-FOR"), 2);
        assert!(headers.is_empty());
    }

    #[test]
    fn token_matching_splits_on_commas() {
        let headers: Headers = [("Transfer-Encoding", "gzip, Chunked")].into_iter().collect();
        assert!(headers.has_token("transfer-encoding", "chunked"));
        assert!(!headers.has_token("transfer-encoding", "deflate"));
    }
}
