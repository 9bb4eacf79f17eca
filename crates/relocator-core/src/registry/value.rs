use serde::{Deserialize, Serialize};

/// Registry hive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Hive {
    HkeyLocalMachine,
    HkeyCurrentUser,
    HkeyClassesRoot,
    HkeyUsers,
}

impl Hive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HkeyLocalMachine => "HKEY_LOCAL_MACHINE",
            Self::HkeyCurrentUser => "HKEY_CURRENT_USER",
            Self::HkeyClassesRoot => "HKEY_CLASSES_ROOT",
            Self::HkeyUsers => "HKEY_USERS",
        }
    }

    fn short(&self) -> &'static str {
        match self {
            Self::HkeyLocalMachine => "HKLM",
            Self::HkeyCurrentUser => "HKCU",
            Self::HkeyClassesRoot => "HKCR",
            Self::HkeyUsers => "HKU",
        }
    }

    fn all() -> [Hive; 4] {
        [
            Self::HkeyLocalMachine,
            Self::HkeyCurrentUser,
            Self::HkeyClassesRoot,
            Self::HkeyUsers,
        ]
    }
}

impl std::fmt::Display for Hive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fully-qualified registry key: hive plus backslash-separated subpath
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistryKeyPath {
    pub hive: Hive,
    pub path: String,
}

impl RegistryKeyPath {
    pub fn new(hive: Hive, path: impl Into<String>) -> Self {
        Self {
            hive,
            path: path.into().trim_matches('\\').to_string(),
        }
    }

    pub fn join(&self, child: &str) -> Self {
        if self.path.is_empty() {
            Self::new(self.hive, child)
        } else {
            Self::new(self.hive, format!("{}\\{}", self.path, child))
        }
    }

    /// Parse `HKEY_LOCAL_MACHINE\...` or `HKLM\...`.
    pub fn parse(full: &str) -> Option<Self> {
        let (head, rest) = match full.split_once('\\') {
            Some((head, rest)) => (head, rest),
            None => (full, ""),
        };
        Hive::all()
            .into_iter()
            .find(|h| head.eq_ignore_ascii_case(h.as_str()) || head.eq_ignore_ascii_case(h.short()))
            .map(|hive| Self::new(hive, rest))
    }
}

impl std::fmt::Display for RegistryKeyPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.hive)
        } else {
            write!(f, "{}\\{}", self.hive, self.path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryValueType {
    String,
    ExpandString,
    MultiString,
    Binary,
    DWord,
    QWord,
}

/// Registry value with its native type. Multi-strings keep each element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum RegistryValue {
    String(String),
    ExpandString(String),
    MultiString(Vec<String>),
    Binary(Vec<u8>),
    DWord(u32),
    QWord(u64),
}

impl RegistryValue {
    pub fn value_type(&self) -> RegistryValueType {
        match self {
            Self::String(_) => RegistryValueType::String,
            Self::ExpandString(_) => RegistryValueType::ExpandString,
            Self::MultiString(_) => RegistryValueType::MultiString,
            Self::Binary(_) => RegistryValueType::Binary,
            Self::DWord(_) => RegistryValueType::DWord,
            Self::QWord(_) => RegistryValueType::QWord,
        }
    }

    /// Human-readable form
    pub fn display(&self) -> String {
        match self {
            Self::String(s) | Self::ExpandString(s) => s.clone(),
            Self::MultiString(items) => items.join("; "),
            Self::Binary(bytes) => {
                decode_utf16_bytes(bytes).unwrap_or_else(|| hex::encode(bytes))
            }
            Self::DWord(v) => v.to_string(),
            Self::QWord(v) => v.to_string(),
        }
    }

    /// Whether the textual form contains `needle`, ignoring case.
    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        match self {
            Self::String(s) | Self::ExpandString(s) => find_ignore_case(s, needle).is_some(),
            Self::MultiString(items) => items.iter().any(|s| find_ignore_case(s, needle).is_some()),
            Self::Binary(bytes) => decode_utf16_bytes(bytes)
                .map(|s| find_ignore_case(&s, needle).is_some())
                .unwrap_or(false),
            Self::DWord(_) | Self::QWord(_) => false,
        }
    }

    /// Rewrite every occurrence of `old` with `new`. `None` when the value has
    /// no textual form to rewrite.
    pub fn replace_ignore_case(&self, old: &str, new: &str) -> Option<RegistryValue> {
        match self {
            Self::String(s) => Some(Self::String(replace_ignore_case(s, old, new))),
            Self::ExpandString(s) => Some(Self::ExpandString(replace_ignore_case(s, old, new))),
            Self::MultiString(items) => Some(Self::MultiString(
                items.iter().map(|s| replace_ignore_case(s, old, new)).collect(),
            )),
            Self::Binary(bytes) => {
                let text = decode_utf16_bytes(bytes)?;
                let trailing = bytes.len() / 2 - text.encode_utf16().count();
                let mut out = utf16_bytes(&replace_ignore_case(&text, old, new));
                out.extend(std::iter::repeat(0u8).take(trailing * 2));
                Some(Self::Binary(out))
            }
            Self::DWord(_) | Self::QWord(_) => None,
        }
    }
}

/// Byte range of the first case-insensitive match of `needle` in `haystack`.
pub fn find_ignore_case(haystack: &str, needle: &str) -> Option<(usize, usize)> {
    if needle.is_empty() {
        return None;
    }
    for (start, _) in haystack.char_indices() {
        let mut rest = haystack[start..].char_indices();
        let mut end = start;
        let mut matched = true;
        for expected in needle.chars() {
            match rest.next() {
                Some((offset, actual)) if chars_equal(actual, expected) => {
                    end = start + offset + actual.len_utf8();
                }
                _ => {
                    matched = false;
                    break;
                }
            }
        }
        if matched {
            return Some((start, end));
        }
    }
    None
}

pub fn replace_ignore_case(haystack: &str, old: &str, new: &str) -> String {
    let mut out = String::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some((start, end)) = find_ignore_case(rest, old) {
        out.push_str(&rest[..start]);
        out.push_str(new);
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

fn chars_equal(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}

/// UTF-16LE bytes without terminator
pub fn utf16_bytes(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|u| u.to_le_bytes()).collect()
}

/// Decode UTF-16LE, dropping trailing NULs. `None` for odd lengths or invalid data.
pub fn decode_utf16_bytes(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let mut units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    String::from_utf16(&units).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_parses_long_and_short_hive_names() {
        let key = RegistryKeyPath::parse(r"HKLM\SOFTWARE\Vendor\App").unwrap();
        assert_eq!(key.hive, Hive::HkeyLocalMachine);
        assert_eq!(key.path, r"SOFTWARE\Vendor\App");
        assert_eq!(key.to_string(), r"HKEY_LOCAL_MACHINE\SOFTWARE\Vendor\App");

        let key = RegistryKeyPath::parse(r"hkey_current_user\Environment").unwrap();
        assert_eq!(key.hive, Hive::HkeyCurrentUser);
        assert!(RegistryKeyPath::parse(r"HKXX\Nope").is_none());
    }

    #[test]
    fn replace_is_case_insensitive_and_global() {
        let out = replace_ignore_case(
            r#""c:\program files\app\app.exe" --data C:\Program Files\App\data"#,
            r"C:\Program Files\App",
            r"D:\Apps\App",
        );
        assert_eq!(out, r#""D:\Apps\App\app.exe" --data D:\Apps\App\data"#);
    }

    #[test]
    fn replace_without_match_is_identity() {
        assert_eq!(replace_ignore_case("nothing here", r"C:\App", r"D:\App"), "nothing here");
        assert_eq!(replace_ignore_case("abc", "", "x"), "abc");
    }

    #[test]
    fn multi_string_rewrites_each_element() {
        let value = RegistryValue::MultiString(vec![
            r"C:\App\bin".into(),
            r"C:\Other".into(),
            r"c:\app\lib".into(),
        ]);
        assert!(value.contains_ignore_case(r"C:\App"));
        let updated = value.replace_ignore_case(r"C:\App", r"D:\App").unwrap();
        assert_eq!(
            updated,
            RegistryValue::MultiString(vec![
                r"D:\App\bin".into(),
                r"C:\Other".into(),
                r"D:\App\lib".into(),
            ])
        );
    }

    #[test]
    fn binary_utf16_keeps_terminator() {
        let mut bytes = utf16_bytes(r"C:\App\x.dll");
        bytes.extend_from_slice(&[0, 0]);
        let value = RegistryValue::Binary(bytes);
        assert!(value.contains_ignore_case(r"c:\app"));

        let RegistryValue::Binary(out) = value.replace_ignore_case(r"C:\App", r"E:\Apps\App").unwrap()
        else {
            panic!("binary value changed type");
        };
        assert_eq!(&out[out.len() - 2..], &[0, 0]);
        assert_eq!(decode_utf16_bytes(&out).unwrap(), r"E:\Apps\App\x.dll");
    }

    #[test]
    fn numbers_never_match_paths() {
        assert!(!RegistryValue::DWord(1).contains_ignore_case("1"));
        assert!(RegistryValue::QWord(7).replace_ignore_case("7", "8").is_none());
    }

    #[test]
    fn value_serializes_with_type_tag() {
        let json = serde_json::to_string(&RegistryValue::ExpandString("%ProgramFiles%".into())).unwrap();
        assert!(json.contains("\"type\":\"expand_string\""));
        let back: RegistryValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back.value_type(), RegistryValueType::ExpandString);
    }
}
