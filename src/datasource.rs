use std::fmt;

use crate::error::{Error, Result};

/// Parser and rewriter for provider connection strings.
///
/// The grammar is a flat sequence of `key=value` tokens:
///
/// ```text
/// dbname='kgr' host=localhost port=5432 user='gis' password='x'
///   sslmode=disable key='id' srid=25832 type=Point
///   table="public"."sites" (geom) sql=
/// ```
///
/// Values are bare, single-quoted (with `\'` and `\\` escapes) or
/// double-quoted identifier chains; a parenthesized geometry column may
/// follow the `table` token; `sql=` consumes the rest of the string. Every
/// segment keeps its original text so that fields which are not rewritten
/// reserialize byte-for-byte, and unknown keys pass through untouched in
/// their original relative order.
#[derive(Debug, Clone)]
pub struct Datasource {
    segments: Vec<Segment>,
    trailing: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    Bare,
    Single,
    Double,
}

#[derive(Debug, Clone)]
struct Segment {
    /// Separator text before this segment, empty for the first one.
    sep: String,
    key: String,
    /// Decoded value; for double-quoted chains the quoted form is kept.
    value: String,
    quoting: Quoting,
    /// Trailing `(column)` group, only ever seen after `table=`.
    paren: Option<String>,
    /// Exact original text, regenerated when the value changes.
    raw: String,
}

impl Segment {
    fn new(key: &str, value: &str, quoting: Quoting) -> Self {
        let mut segment = Segment {
            sep: " ".to_string(),
            key: key.to_string(),
            value: value.to_string(),
            quoting,
            paren: None,
            raw: String::new(),
        };
        segment.re_encode();
        segment
    }

    fn set_value(&mut self, value: &str) {
        self.value = value.to_string();
        if self.quoting == Quoting::Bare
            && value.chars().any(|c| c.is_whitespace() || c == '\'')
        {
            self.quoting = Quoting::Single;
        }
        self.re_encode();
    }

    fn re_encode(&mut self) {
        let encoded = match self.quoting {
            Quoting::Bare => self.value.clone(),
            Quoting::Single => format!("'{}'", escape_quoted(&self.value, '\'')),
            Quoting::Double => self.value.clone(),
        };
        self.raw = format!("{}={}", self.key, encoded);
        if let Some(column) = &self.paren {
            self.raw.push_str(&format!(" ({})", column));
        }
    }
}

/// Edit instruction for one connection field. `Set("")` is treated as
/// `Keep` so callers can forward optional user input directly; removal is
/// an explicit state because a deleted field and an empty field mean
/// different things to downstream drivers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldEdit {
    #[default]
    Keep,
    Set(String),
    Remove,
}

impl FieldEdit {
    pub fn from_option(value: Option<String>) -> Self {
        match value {
            Some(v) if !v.is_empty() => FieldEdit::Set(v),
            _ => FieldEdit::Keep,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FieldOverrides {
    pub host: FieldEdit,
    pub port: FieldEdit,
    pub dbname: FieldEdit,
    pub user: FieldEdit,
    pub password: FieldEdit,
    pub schema: FieldEdit,
}

impl Datasource {
    pub fn parse(input: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut pos = 0;

        loop {
            let rest = &input[pos..];
            let sep_len = rest.len() - rest.trim_start().len();
            let sep = &rest[..sep_len];
            let rest = &rest[sep_len..];
            pos += sep_len;

            if rest.is_empty() {
                return Ok(Datasource {
                    segments,
                    trailing: sep.to_string(),
                });
            }

            let (segment, consumed) = parse_segment(rest, sep)?;
            segments.push(segment);
            pos += consumed;
        }
    }

    /// Decoded value of the first field with this key, `None` when the
    /// field is absent. An empty string therefore means present-but-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.key == key)
            .map(|s| s.value.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.get("host")
    }

    pub fn port(&self) -> Option<&str> {
        self.get("port")
    }

    pub fn dbname(&self) -> Option<&str> {
        self.get("dbname")
    }

    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn password(&self) -> Option<&str> {
        self.get("password")
    }

    pub fn has_credentials(&self) -> bool {
        self.get("user").is_some() || self.get("password").is_some()
    }

    /// Schema and table decoded from the `table` segment. A bare table
    /// name falls back to the `public` schema.
    pub fn schema_and_table(&self) -> Option<(String, String)> {
        let segment = self.segments.iter().find(|s| s.key == "table")?;
        match segment.quoting {
            Quoting::Double => {
                let parts = parse_quoted_chain(&segment.value);
                match parts.len() {
                    0 => None,
                    1 => Some(("public".to_string(), parts[0].clone())),
                    _ => Some((parts[0].clone(), parts[1].clone())),
                }
            }
            _ => Some(("public".to_string(), segment.value.clone())),
        }
    }

    pub fn geometry_column(&self) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.key == "table")
            .and_then(|s| s.paren.as_deref())
    }

    /// Non-empty `sql=` subset clause.
    pub fn subset_clause(&self) -> Option<&str> {
        match self.get("sql") {
            Some(clause) if !clause.is_empty() => Some(clause),
            _ => None,
        }
    }

    /// Exact, case-sensitive match on host, port and database name, used
    /// to decide whether a stored layer points at a given source server.
    pub fn matches_source(&self, host: &str, port: &str, dbname: &str) -> bool {
        self.get("host") == Some(host)
            && self.get("port") == Some(port)
            && self.get("dbname") == Some(dbname)
    }

    pub fn rewrite(&self, overrides: &FieldOverrides) -> Datasource {
        let mut out = self.clone();
        out.apply(overrides);
        out
    }

    /// Removes username and password entirely. Removal, not blanking:
    /// drivers treat an absent credential as "prompt the user".
    pub fn strip_credentials(&self) -> Datasource {
        self.rewrite(&FieldOverrides {
            user: FieldEdit::Remove,
            password: FieldEdit::Remove,
            ..FieldOverrides::default()
        })
    }

    fn apply(&mut self, overrides: &FieldOverrides) {
        let edits = [
            ("host", &overrides.host),
            ("port", &overrides.port),
            ("dbname", &overrides.dbname),
            ("user", &overrides.user),
            ("password", &overrides.password),
        ];
        for (key, edit) in edits {
            match edit {
                FieldEdit::Keep => {}
                FieldEdit::Set(value) if value.is_empty() => {}
                FieldEdit::Set(value) => self.set_field(key, value),
                FieldEdit::Remove => self.remove_field(key),
            }
        }
        if let FieldEdit::Set(schema) = &overrides.schema {
            if !schema.is_empty() {
                self.set_schema(schema);
            }
        }
    }

    fn set_field(&mut self, key: &str, value: &str) {
        let mut found = false;
        for segment in self.segments.iter_mut().filter(|s| s.key == key) {
            segment.set_value(value);
            found = true;
        }
        if !found {
            let quoting = match key {
                "host" | "port" => Quoting::Bare,
                _ => Quoting::Single,
            };
            // New connection fields go in front of the table reference so
            // the conventional field order stays intact.
            let at = self
                .segments
                .iter()
                .position(|s| s.key == "table" || s.key == "sql")
                .unwrap_or(self.segments.len());
            self.insert_segment(at, Segment::new(key, value, quoting));
        }
    }

    fn insert_segment(&mut self, at: usize, mut segment: Segment) {
        if at == 0 {
            segment.sep = String::new();
            if let Some(first) = self.segments.first_mut() {
                if first.sep.is_empty() {
                    first.sep = " ".to_string();
                }
            }
        }
        self.segments.insert(at, segment);
    }

    fn remove_field(&mut self, key: &str) {
        let strip_new_first_sep = self
            .segments
            .first()
            .map(|s| s.key == key && s.sep.is_empty())
            .unwrap_or(false);
        self.segments.retain(|s| s.key != key);
        if strip_new_first_sep {
            if let Some(first) = self.segments.first_mut() {
                first.sep.clear();
            }
        }
    }

    fn set_schema(&mut self, schema: &str) {
        if let Some(segment) = self.segments.iter_mut().find(|s| s.key == "table") {
            let table = match segment.quoting {
                Quoting::Double => {
                    let parts = parse_quoted_chain(&segment.value);
                    match parts.last() {
                        Some(name) => name.clone(),
                        None => return,
                    }
                }
                _ => segment.value.clone(),
            };
            segment.quoting = Quoting::Double;
            segment.value = format!(
                "\"{}\".\"{}\"",
                escape_quoted(schema, '"'),
                escape_quoted(&table, '"')
            );
            segment.re_encode();
        }
    }
}

impl fmt::Display for Datasource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            write!(f, "{}{}", segment.sep, segment.raw)?;
        }
        write!(f, "{}", self.trailing)
    }
}

fn parse_segment(rest: &str, sep: &str) -> Result<(Segment, usize)> {
    let eq = rest
        .find('=')
        .ok_or_else(|| Error::Datasource(format!("token without '=' near '{}'", preview(rest))))?;
    let key = &rest[..eq];
    if key.is_empty() || key.chars().any(char::is_whitespace) {
        return Err(Error::Datasource(format!(
            "malformed key near '{}'",
            preview(rest)
        )));
    }

    if key == "sql" {
        // The sql clause always terminates the string.
        let value = &rest[eq + 1..];
        let segment = Segment {
            sep: sep.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            quoting: Quoting::Bare,
            paren: None,
            raw: rest.to_string(),
        };
        return Ok((segment, rest.len()));
    }

    let after = &rest[eq + 1..];
    let (value, quoting, value_len) = if after.starts_with('\'') {
        let (decoded, len) = scan_quoted(after, '\'')?;
        (decoded, Quoting::Single, len)
    } else if after.starts_with('"') {
        let len = scan_quoted_chain(after)?;
        (after[..len].to_string(), Quoting::Double, len)
    } else {
        let len = after.find(char::is_whitespace).unwrap_or(after.len());
        (after[..len].to_string(), Quoting::Bare, len)
    };

    let mut consumed = eq + 1 + value_len;

    // Optional geometry column group, e.g. `table="s"."t" (geom)`.
    let mut paren = None;
    let tail = &rest[consumed..];
    let ws = tail.len() - tail.trim_start().len();
    let after_ws = &tail[ws..];
    if let Some(inner) = after_ws.strip_prefix('(') {
        if let Some(close) = inner.find(')') {
            paren = Some(inner[..close].to_string());
            consumed += ws + close + 2;
        }
    }

    let segment = Segment {
        sep: sep.to_string(),
        key: key.to_string(),
        value,
        quoting,
        paren,
        raw: rest[..consumed].to_string(),
    };
    Ok((segment, consumed))
}

/// Scans one quoted literal starting at `s[0] == quote`, returning the
/// decoded content and the byte length consumed including both quotes.
fn scan_quoted(s: &str, quote: char) -> Result<(String, usize)> {
    let mut decoded = String::new();
    let mut chars = s.char_indices().skip(1);
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some((_, escaped)) => decoded.push(escaped),
                None => break,
            }
        } else if c == quote {
            return Ok((decoded, i + quote.len_utf8()));
        } else {
            decoded.push(c);
        }
    }
    Err(Error::Datasource(format!(
        "unterminated quote near '{}'",
        preview(s)
    )))
}

/// Byte length of a `"a"."b"` identifier chain starting at `s[0] == '"'`.
fn scan_quoted_chain(s: &str) -> Result<usize> {
    let mut len = 0;
    loop {
        let (_, part_len) = scan_quoted(&s[len..], '"')?;
        len += part_len;
        if s[len..].starts_with('.') && s[len + 1..].starts_with('"') {
            len += 1;
        } else {
            return Ok(len);
        }
    }
}

/// Decoded identifier parts of a stored `"a"."b"` chain.
fn parse_quoted_chain(value: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = value;
    while rest.starts_with('"') {
        match scan_quoted(rest, '"') {
            Ok((part, len)) => {
                parts.push(part);
                rest = &rest[len..];
                if rest.starts_with('.') {
                    rest = &rest[1..];
                }
            }
            Err(_) => break,
        }
    }
    parts
}

fn escape_quoted(value: &str, quote: char) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == quote {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn preview(s: &str) -> String {
    s.chars().take(40).collect()
}
