//! Keyed archive helpers
//!
//! A keyed archive is a property list of the form
//! `{ $archiver, $version, $top, $objects }` where objects refer to each
//! other through UIDs (indexes into `$objects`). Requests embedded in
//! resume tokens are stored this way.

use crate::error::BgdlError;
use plist::{Dictionary, Uid, Value};
use std::io::Cursor;
use url::Url;

/// Canonical key of the root object in `$top`
pub const ROOT_KEY: &str = "root";
/// Root key spelling written by some platform versions
pub const LEGACY_ROOT_KEY: &str = "NSKeyedArchiveRootObjectKey";
/// Prefix of auxiliary request property keys that canonical decoders reject
pub const PROTO_PROP_PREFIX: &str = "__nsurlrequest_proto_prop";

const ARCHIVER: &str = "NSKeyedArchiver";
const ARCHIVE_VERSION: u64 = 100_000;
const NULL_OBJECT: &str = "$null";

/// Index of the request object inside `$objects`
pub const REQUEST_OBJECT_INDEX: usize = 1;

/// Parse any property list (binary or XML)
pub fn parse(bytes: &[u8]) -> Result<Value, BgdlError> {
    Ok(Value::from_reader(Cursor::new(bytes))?)
}

/// Serialize to the binary property list format
pub fn to_binary(value: &Value) -> Result<Vec<u8>, BgdlError> {
    let mut out = Vec::new();
    value.to_writer_binary(&mut out)?;
    Ok(out)
}

/// Serialize to the XML property list format
pub fn to_xml(value: &Value) -> Result<Vec<u8>, BgdlError> {
    let mut out = Vec::new();
    value.to_writer_xml(&mut out)?;
    Ok(out)
}

/// Whether the bytes look like an XML property list
pub fn is_xml(bytes: &[u8]) -> bool {
    let trimmed = bytes
        .strip_prefix(b"\xEF\xBB\xBF".as_slice())
        .unwrap_or(bytes);
    let start = trimmed
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(trimmed.len());
    trimmed[start..].starts_with(b"<?xml") || trimmed[start..].starts_with(b"<plist")
}

/// Whether a dictionary is a keyed archive rather than a plain dictionary
pub fn is_keyed_archive(dict: &Dictionary) -> bool {
    dict.contains_key("$archiver") && dict.contains_key("$objects")
}

fn uid_of(value: &Value) -> Option<usize> {
    match value {
        Value::Uid(uid) => usize::try_from(uid.get()).ok(),
        _ => None,
    }
}

/// Encode a request as a canonical keyed archive (binary plist)
pub fn encode_request(url: &Url, method: &str, timeout_secs: f64) -> Result<Vec<u8>, BgdlError> {
    let mut request = Dictionary::new();
    request.insert("$class".to_string(), Value::Uid(Uid::new(4)));
    request.insert("$0".to_string(), Value::Uid(Uid::new(2)));
    request.insert("$1".to_string(), Value::Uid(Uid::new(3)));
    request.insert("$2".to_string(), Value::Real(timeout_secs));

    let mut class = Dictionary::new();
    class.insert(
        "$classname".to_string(),
        Value::String("NSURLRequest".to_string()),
    );
    class.insert(
        "$classes".to_string(),
        Value::Array(vec![
            Value::String("NSURLRequest".to_string()),
            Value::String("NSObject".to_string()),
        ]),
    );

    let objects = vec![
        Value::String(NULL_OBJECT.to_string()),
        Value::Dictionary(request),
        Value::String(url.to_string()),
        Value::String(method.to_string()),
        Value::Dictionary(class),
    ];

    let mut top = Dictionary::new();
    top.insert(
        ROOT_KEY.to_string(),
        Value::Uid(Uid::new(REQUEST_OBJECT_INDEX as u64)),
    );

    let mut archive = Dictionary::new();
    archive.insert("$archiver".to_string(), Value::String(ARCHIVER.to_string()));
    archive.insert("$objects".to_string(), Value::Array(objects));
    archive.insert("$top".to_string(), Value::Dictionary(top));
    archive.insert("$version".to_string(), Value::Integer(ARCHIVE_VERSION.into()));

    to_binary(&Value::Dictionary(archive))
}

/// Decode a canonical request archive and return the request URL.
///
/// Fails on archives that still carry auxiliary `__nsurlrequest_proto_*`
/// keys or a non-canonical root key.
pub fn decode_request(bytes: &[u8]) -> Result<Url, BgdlError> {
    let invalid = |msg: &str| BgdlError::InvalidResumeData(format!("request archive: {msg}"));

    let archive = parse(bytes)?
        .into_dictionary()
        .ok_or_else(|| invalid("not a dictionary"))?;
    let root = archive
        .get("$top")
        .and_then(Value::as_dictionary)
        .and_then(|top| top.get(ROOT_KEY))
        .and_then(uid_of)
        .ok_or_else(|| invalid("missing root object"))?;
    let objects = archive
        .get("$objects")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing object table"))?;
    let request = objects
        .get(root)
        .and_then(Value::as_dictionary)
        .ok_or_else(|| invalid("root is not an object"))?;

    if let Some(key) = request.keys().find(|k| k.starts_with(PROTO_PROP_PREFIX)) {
        return Err(invalid(&format!("unexpected key {key}")));
    }

    let url = request
        .get("$0")
        .and_then(uid_of)
        .and_then(|i| objects.get(i))
        .and_then(Value::as_string)
        .ok_or_else(|| invalid("missing URL"))?;

    Url::parse(url).map_err(|e| invalid(&format!("bad URL {url}: {e}")))
}

/// Read a resume dictionary.
///
/// Accepts a plain property list dictionary, or a keyed archive whose root
/// object is a dictionary (`NS.keys` / `NS.objects`) under either root key
/// spelling.
pub fn resume_dictionary(bytes: &[u8]) -> Result<Dictionary, BgdlError> {
    let dict = parse(bytes)?
        .into_dictionary()
        .ok_or_else(|| BgdlError::InvalidResumeData("not a dictionary".to_string()))?;

    if is_keyed_archive(&dict) {
        unarchive_dictionary(&dict)
    } else {
        Ok(dict)
    }
}

fn unarchive_dictionary(archive: &Dictionary) -> Result<Dictionary, BgdlError> {
    let invalid = |msg: &str| BgdlError::InvalidResumeData(format!("keyed resume data: {msg}"));

    let top = archive
        .get("$top")
        .and_then(Value::as_dictionary)
        .ok_or_else(|| invalid("missing $top"))?;
    let root = top
        .get(LEGACY_ROOT_KEY)
        .or_else(|| top.get(ROOT_KEY))
        .and_then(uid_of)
        .ok_or_else(|| invalid("missing root object"))?;
    let objects = archive
        .get("$objects")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing object table"))?;
    let root = objects
        .get(root)
        .and_then(Value::as_dictionary)
        .ok_or_else(|| invalid("root is not a dictionary"))?;

    let keys = root
        .get("NS.keys")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing NS.keys"))?;
    let values = root
        .get("NS.objects")
        .and_then(Value::as_array)
        .ok_or_else(|| invalid("missing NS.objects"))?;
    if keys.len() != values.len() {
        return Err(invalid("key and value counts differ"));
    }

    let resolve = |value: &Value| -> Option<Value> {
        match uid_of(value) {
            Some(i) => objects
                .get(i)
                .filter(|v| v.as_string() != Some(NULL_OBJECT))
                .cloned(),
            None => Some(value.clone()),
        }
    };

    let mut out = Dictionary::new();
    for (key, value) in keys.iter().zip(values) {
        let key = resolve(key)
            .and_then(|k| k.as_string().map(str::to_string))
            .ok_or_else(|| invalid("non-string key"))?;
        if let Some(value) = resolve(value) {
            out.insert(key, value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_archive_round_trip() {
        let url = Url::parse("http://host/path/file.zip?tag=3").unwrap();
        let bytes = encode_request(&url, "GET", 60.0).unwrap();
        assert_eq!(decode_request(&bytes).unwrap(), url);
        assert!(!is_xml(&bytes));
    }

    #[test]
    fn test_decode_rejects_auxiliary_keys() {
        let url = Url::parse("http://host/a.bin").unwrap();
        let mut archive = parse(&encode_request(&url, "GET", 60.0).unwrap())
            .unwrap()
            .into_dictionary()
            .unwrap();
        let request = archive
            .get_mut("$objects")
            .and_then(Value::as_array_mut)
            .and_then(|objects| objects.get_mut(1))
            .and_then(Value::as_dictionary_mut)
            .unwrap();
        request.insert(
            "__nsurlrequest_proto_prop_obj_0".to_string(),
            Value::Uid(Uid::new(0)),
        );
        let bytes = to_binary(&Value::Dictionary(archive)).unwrap();
        assert!(decode_request(&bytes).is_err());
    }

    #[test]
    fn test_keyed_resume_dictionary() {
        let mut root = Dictionary::new();
        root.insert(
            "NS.keys".to_string(),
            Value::Array(vec![Value::Uid(Uid::new(2)), Value::Uid(Uid::new(3))]),
        );
        root.insert(
            "NS.objects".to_string(),
            Value::Array(vec![Value::Uid(Uid::new(4)), Value::Integer(42u64.into())]),
        );
        let objects = vec![
            Value::String("$null".to_string()),
            Value::Dictionary(root),
            Value::String("NSURLSessionDownloadURL".to_string()),
            Value::String("NSURLSessionResumeBytesReceived".to_string()),
            Value::String("http://host/f".to_string()),
        ];
        let mut top = Dictionary::new();
        top.insert(LEGACY_ROOT_KEY.to_string(), Value::Uid(Uid::new(1)));
        let mut archive = Dictionary::new();
        archive.insert("$archiver".to_string(), Value::String("NSKeyedArchiver".to_string()));
        archive.insert("$objects".to_string(), Value::Array(objects));
        archive.insert("$top".to_string(), Value::Dictionary(top));

        let bytes = to_binary(&Value::Dictionary(archive)).unwrap();
        let dict = resume_dictionary(&bytes).unwrap();
        assert_eq!(
            dict.get("NSURLSessionDownloadURL").and_then(Value::as_string),
            Some("http://host/f")
        );
        assert_eq!(
            dict.get("NSURLSessionResumeBytesReceived")
                .and_then(Value::as_unsigned_integer),
            Some(42)
        );
    }

    #[test]
    fn test_is_xml() {
        assert!(is_xml(b"<?xml version=\"1.0\"?><plist/>"));
        assert!(is_xml(b"  \n<plist version=\"1.0\"/>"));
        assert!(!is_xml(b"bplist00"));
    }
}
