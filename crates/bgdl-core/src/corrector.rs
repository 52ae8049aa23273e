//! Resume token correction
//!
//! Resume tokens embed the current and original HTTP requests as keyed
//! archives. Depending on the platform version that wrote them, the
//! auxiliary request properties are keyed `__nsurlrequest_proto_prop_obj_<n>`
//! (or `__nsurlrequest_proto_props`) instead of the numeric `$<n>` keys a
//! canonical decoder expects, and the root object may sit under
//! `NSKeyedArchiveRootObjectKey` instead of `root`. Such a token cannot be
//! resumed until its keys are rewritten.

use crate::archive::{self, LEGACY_ROOT_KEY, REQUEST_OBJECT_INDEX, ROOT_KEY};
use crate::transport::resume_data::{CURRENT_REQUEST_KEY, ORIGINAL_REQUEST_KEY};
use bgdl_types::CORRECTION_MIN_PLATFORM_VERSION;
use plist::Value;
use tracing::{debug, warn};

const PROTO_PROP_OBJ_KEY: &str = "__nsurlrequest_proto_prop_obj_";
const PROTO_PROPS_KEY: &str = "__nsurlrequest_proto_props";

/// Outcome of correcting a resume token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Correction {
    /// Keys were rewritten; use these bytes
    Corrected(Vec<u8>),
    /// Nothing to fix; the input bytes are returned untouched
    Unmodified(Vec<u8>),
    /// The token cannot be read or rewritten
    Unrecoverable(String),
}

/// Repairs cross-version key drift in resume tokens
#[derive(Debug, Clone, Copy)]
pub struct ResumeTokenCorrector {
    platform_version: f32,
}

impl ResumeTokenCorrector {
    pub fn new(platform_version: f32) -> Self {
        Self { platform_version }
    }

    /// Correct a raw resume token.
    ///
    /// Both embedded requests are corrected independently, then the outer
    /// dictionary is written back as an XML property list. A request that
    /// cannot be corrected is dropped from the token; only an unreadable
    /// token as a whole is unrecoverable.
    pub fn correct(&self, token: &[u8]) -> Correction {
        if self.platform_version < CORRECTION_MIN_PLATFORM_VERSION {
            return Correction::Unmodified(token.to_vec());
        }

        let mut dict = match archive::resume_dictionary(token) {
            Ok(dict) => dict,
            Err(e) => return Correction::Unrecoverable(e.to_string()),
        };
        let plain = archive::parse(token)
            .ok()
            .and_then(Value::into_dictionary)
            .map(|d| !archive::is_keyed_archive(&d))
            .unwrap_or(false);

        let mut changed = !plain || !archive::is_xml(token);
        for key in [CURRENT_REQUEST_KEY, ORIGINAL_REQUEST_KEY] {
            let Some(request) = dict.get(key).and_then(Value::as_data).map(<[u8]>::to_vec) else {
                continue;
            };
            match correct_request_archive(&request) {
                Some(fixed) => {
                    if fixed != request {
                        changed = true;
                        dict.insert(key.to_string(), Value::Data(fixed));
                    }
                }
                None => {
                    warn!("Dropping {} from resume token, it cannot be corrected", key);
                    changed = true;
                    dict.remove(key);
                }
            }
        }

        if !changed {
            return Correction::Unmodified(token.to_vec());
        }

        match archive::to_xml(&Value::Dictionary(dict)) {
            Ok(bytes) => Correction::Corrected(bytes),
            Err(e) => Correction::Unrecoverable(e.to_string()),
        }
    }
}

/// Correct one embedded request archive.
///
/// Returns the input unchanged when it already decodes, the rewritten
/// binary archive when it does not, and `None` when it is not a property
/// list at all or cannot be written back.
pub fn correct_request_archive(data: &[u8]) -> Option<Vec<u8>> {
    if archive::decode_request(data).is_ok() {
        return Some(data.to_vec());
    }

    let mut root = archive::parse(data).ok()?.into_dictionary()?;

    if let Some(request) = root
        .get_mut("$objects")
        .and_then(Value::as_array_mut)
        .and_then(|objects| objects.get_mut(REQUEST_OBJECT_INDEX))
        .and_then(Value::as_dictionary_mut)
    {
        let k = (0..)
            .take_while(|n| request.contains_key(&format!("${n}")))
            .count();

        let mut i = 0;
        while let Some(value) = request.remove(&format!("{PROTO_PROP_OBJ_KEY}{i}")) {
            request.insert(format!("${}", i + k), value);
            i += 1;
        }
        if let Some(value) = request.remove(PROTO_PROPS_KEY) {
            request.insert(format!("${}", i + k), value);
        }
        debug!("Renamed {} auxiliary request properties after ${}", i, k);
    }

    if let Some(top) = root.get_mut("$top").and_then(Value::as_dictionary_mut) {
        if let Some(value) = top.remove(LEGACY_ROOT_KEY) {
            top.insert(ROOT_KEY.to_string(), value);
        }
    }

    archive::to_binary(&Value::Dictionary(root)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::resume_data::ResumeData;
    use plist::{Dictionary, Uid};
    use url::Url;

    fn drifted_request(extra_props: usize, with_props: bool, legacy_root: bool) -> Vec<u8> {
        let url = Url::parse("http://host/path/file.zip?tag=3").unwrap();
        let mut root = archive::parse(&archive::encode_request(&url, "GET", 60.0).unwrap())
            .unwrap()
            .into_dictionary()
            .unwrap();
        {
            let request = request_object(&mut root);
            request.remove("$2");
            for i in 0..extra_props {
                request.insert(
                    format!("{PROTO_PROP_OBJ_KEY}{i}"),
                    Value::Integer((100 + i as u64).into()),
                );
            }
            if with_props {
                request.insert(PROTO_PROPS_KEY.to_string(), Value::Uid(Uid::new(0)));
            }
        }
        if legacy_root {
            let top = root.get_mut("$top").and_then(Value::as_dictionary_mut).unwrap();
            let value = top.remove(ROOT_KEY).unwrap();
            top.insert(LEGACY_ROOT_KEY.to_string(), value);
        }
        archive::to_binary(&Value::Dictionary(root)).unwrap()
    }

    fn request_object(root: &mut Dictionary) -> &mut Dictionary {
        root.get_mut("$objects")
            .and_then(Value::as_array_mut)
            .and_then(|objects| objects.get_mut(1))
            .and_then(Value::as_dictionary_mut)
            .unwrap()
    }

    fn token_with(request: Vec<u8>) -> Vec<u8> {
        let mut dict = Dictionary::new();
        dict.insert(
            "NSURLSessionDownloadURL".to_string(),
            Value::String("http://host/path/file.zip?tag=3".to_string()),
        );
        dict.insert(CURRENT_REQUEST_KEY.to_string(), Value::Data(request.clone()));
        dict.insert(ORIGINAL_REQUEST_KEY.to_string(), Value::Data(request));
        archive::to_binary(&Value::Dictionary(dict)).unwrap()
    }

    #[test]
    fn test_aux_keys_continue_numeric_sequence() {
        // $0 and $1 exist (k = 2)
        let fixed = correct_request_archive(&drifted_request(2, false, false)).unwrap();
        let mut root = archive::parse(&fixed).unwrap().into_dictionary().unwrap();
        let request = request_object(&mut root);

        assert_eq!(request.get("$2").and_then(Value::as_unsigned_integer), Some(100));
        assert_eq!(request.get("$3").and_then(Value::as_unsigned_integer), Some(101));
        assert!(!request.keys().any(|k| k.starts_with("__nsurlrequest_proto")));
        assert!(archive::decode_request(&fixed).is_ok());
    }

    #[test]
    fn test_singular_props_key_follows_obj_keys() {
        let fixed = correct_request_archive(&drifted_request(1, true, false)).unwrap();
        let mut root = archive::parse(&fixed).unwrap().into_dictionary().unwrap();
        let request = request_object(&mut root);

        assert!(request.contains_key("$2"));
        assert!(matches!(request.get("$3"), Some(Value::Uid(_))));
        assert!(!request.contains_key(PROTO_PROPS_KEY));
    }

    #[test]
    fn test_legacy_root_key_renamed() {
        let fixed = correct_request_archive(&drifted_request(0, false, true)).unwrap();
        let root = archive::parse(&fixed).unwrap().into_dictionary().unwrap();
        let top = root.get("$top").and_then(Value::as_dictionary).unwrap();
        assert!(top.contains_key(ROOT_KEY));
        assert!(!top.contains_key(LEGACY_ROOT_KEY));
    }

    #[test]
    fn test_canonical_request_untouched() {
        let url = Url::parse("http://host/a").unwrap();
        let canonical = archive::encode_request(&url, "GET", 60.0).unwrap();
        assert_eq!(correct_request_archive(&canonical), Some(canonical));
    }

    fn bytes(correction: Correction) -> Vec<u8> {
        match correction {
            Correction::Corrected(bytes) | Correction::Unmodified(bytes) => bytes,
            Correction::Unrecoverable(reason) => panic!("unrecoverable: {reason}"),
        }
    }

    #[test]
    fn test_garbage_request_is_dropped() {
        assert!(correct_request_archive(b"definitely not a plist").is_none());

        let mut dict = archive::resume_dictionary(&token_with(drifted_request(1, false, false)))
            .unwrap();
        dict.insert(CURRENT_REQUEST_KEY.to_string(), Value::Data(b"garbage".to_vec()));
        let token = archive::to_binary(&Value::Dictionary(dict)).unwrap();

        let corrected = match ResumeTokenCorrector::new(10.0).correct(&token) {
            Correction::Corrected(bytes) => bytes,
            other => panic!("expected correction, got {other:?}"),
        };
        let dict = archive::resume_dictionary(&corrected).unwrap();
        assert!(!dict.contains_key(CURRENT_REQUEST_KEY));
        let original = dict.get(ORIGINAL_REQUEST_KEY).and_then(Value::as_data).unwrap();
        assert!(archive::decode_request(original).is_ok());
    }

    #[test]
    fn test_unreadable_token_is_unrecoverable() {
        assert!(matches!(
            ResumeTokenCorrector::new(10.0).correct(b"not a token"),
            Correction::Unrecoverable(_)
        ));
    }

    #[test]
    fn test_drifted_token_is_corrected_to_xml() {
        let token = token_with(drifted_request(2, true, true));
        let corrected = match ResumeTokenCorrector::new(11.0).correct(&token) {
            Correction::Corrected(bytes) => bytes,
            other => panic!("expected correction, got {other:?}"),
        };
        assert!(archive::is_xml(&corrected));

        let dict = archive::resume_dictionary(&corrected).unwrap();
        for key in [CURRENT_REQUEST_KEY, ORIGINAL_REQUEST_KEY] {
            let request = dict.get(key).and_then(Value::as_data).unwrap();
            assert!(archive::decode_request(request).is_ok());
        }
    }

    #[test]
    fn test_corrected_token_is_fixed_point() {
        let corrector = ResumeTokenCorrector::new(10.0);
        let once = bytes(corrector.correct(&token_with(drifted_request(2, false, true))));
        assert_eq!(corrector.correct(&once), Correction::Unmodified(once.clone()));
    }

    #[test]
    fn test_transport_token_becomes_xml_and_stays_decodable() {
        let data = ResumeData {
            url: Url::parse("http://host/f.bin?tag=9").unwrap(),
            bytes_received: 10,
            temp_file_name: "x.part".to_string(),
            entity_tag: None,
            last_modified: Some("Wed, 21 Oct 2015 07:28:00 GMT".to_string()),
        };
        let corrected = bytes(ResumeTokenCorrector::new(10.0).correct(&data.encode().unwrap()));
        assert!(archive::is_xml(&corrected));
        assert_eq!(ResumeData::decode(&corrected).unwrap(), data);
    }

    #[test]
    fn test_old_platform_passes_through() {
        let token = token_with(drifted_request(2, false, false));
        assert_eq!(
            ResumeTokenCorrector::new(9.3).correct(&token),
            Correction::Unmodified(token)
        );
    }
}
