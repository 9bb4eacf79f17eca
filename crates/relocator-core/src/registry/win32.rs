use std::io;

use winreg::enums::{
    RegType, HKEY, HKEY_CLASSES_ROOT, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, HKEY_USERS,
    KEY_READ, KEY_SET_VALUE,
};
use winreg::{RegKey, RegValue};

use super::store::RegistryStore;
use super::value::{decode_utf16_bytes, utf16_bytes, Hive, RegistryKeyPath, RegistryValue};

/// The live Windows registry
#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsRegistry;

impl WindowsRegistry {
    fn open(key: &RegistryKeyPath, access: u32) -> io::Result<RegKey> {
        let root = RegKey::predef(predef(key.hive));
        if key.path.is_empty() {
            Ok(root)
        } else {
            root.open_subkey_with_flags(&key.path, access)
        }
    }
}

fn predef(hive: Hive) -> HKEY {
    match hive {
        Hive::HkeyLocalMachine => HKEY_LOCAL_MACHINE,
        Hive::HkeyCurrentUser => HKEY_CURRENT_USER,
        Hive::HkeyClassesRoot => HKEY_CLASSES_ROOT,
        Hive::HkeyUsers => HKEY_USERS,
    }
}

impl RegistryStore for WindowsRegistry {
    fn subkeys(&self, key: &RegistryKeyPath) -> io::Result<Vec<String>> {
        Self::open(key, KEY_READ)?.enum_keys().collect()
    }

    fn values(&self, key: &RegistryKeyPath) -> io::Result<Vec<(String, RegistryValue)>> {
        let opened = Self::open(key, KEY_READ)?;
        let mut out = Vec::new();
        for item in opened.enum_values() {
            let (name, raw) = item?;
            if let Some(value) = from_raw(&raw) {
                out.push((name, value));
            }
        }
        Ok(out)
    }

    fn set_value(&self, key: &RegistryKeyPath, name: &str, value: &RegistryValue) -> io::Result<()> {
        Self::open(key, KEY_SET_VALUE)?.set_raw_value(name, &to_raw(value))
    }
}

// REG_NONE, REG_LINK and resource lists are never path carriers.
fn from_raw(raw: &RegValue) -> Option<RegistryValue> {
    match raw.vtype {
        RegType::REG_SZ => decode_utf16_bytes(&raw.bytes).map(RegistryValue::String),
        RegType::REG_EXPAND_SZ => decode_utf16_bytes(&raw.bytes).map(RegistryValue::ExpandString),
        RegType::REG_MULTI_SZ => decode_utf16_bytes(&raw.bytes).map(|joined| {
            RegistryValue::MultiString(
                joined
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            )
        }),
        RegType::REG_BINARY => Some(RegistryValue::Binary(raw.bytes.clone())),
        RegType::REG_DWORD => raw
            .bytes
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(|b| RegistryValue::DWord(u32::from_le_bytes(b))),
        RegType::REG_QWORD => raw
            .bytes
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .map(|b| RegistryValue::QWord(u64::from_le_bytes(b))),
        _ => None,
    }
}

fn to_raw(value: &RegistryValue) -> RegValue {
    let terminated = |s: &str| {
        let mut bytes = utf16_bytes(s);
        bytes.extend_from_slice(&[0, 0]);
        bytes
    };
    match value {
        RegistryValue::String(s) => RegValue {
            bytes: terminated(s),
            vtype: RegType::REG_SZ,
        },
        RegistryValue::ExpandString(s) => RegValue {
            bytes: terminated(s),
            vtype: RegType::REG_EXPAND_SZ,
        },
        RegistryValue::MultiString(items) => {
            let mut bytes = Vec::new();
            for item in items {
                bytes.extend(terminated(item));
            }
            bytes.extend_from_slice(&[0, 0]);
            RegValue {
                bytes,
                vtype: RegType::REG_MULTI_SZ,
            }
        }
        RegistryValue::Binary(bytes) => RegValue {
            bytes: bytes.clone(),
            vtype: RegType::REG_BINARY,
        },
        RegistryValue::DWord(v) => RegValue {
            bytes: v.to_le_bytes().to_vec(),
            vtype: RegType::REG_DWORD,
        },
        RegistryValue::QWord(v) => RegValue {
            bytes: v.to_le_bytes().to_vec(),
            vtype: RegType::REG_QWORD,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_string_encoding_round_trips() {
        let value = RegistryValue::MultiString(vec![r"C:\A".into(), r"C:\B".into()]);
        assert_eq!(from_raw(&to_raw(&value)), Some(value));
    }

    #[test]
    fn dword_encoding_round_trips() {
        let value = RegistryValue::DWord(0x1234_5678);
        assert_eq!(from_raw(&to_raw(&value)), Some(value));
    }
}
