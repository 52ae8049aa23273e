//! Resume payload produced by the transport when a task is interrupted

use crate::archive;
use crate::error::BgdlError;
use plist::{Dictionary, Value};
use url::Url;

pub const DOWNLOAD_URL_KEY: &str = "NSURLSessionDownloadURL";
pub const BYTES_RECEIVED_KEY: &str = "NSURLSessionResumeBytesReceived";
pub const TEMP_FILE_NAME_KEY: &str = "NSURLSessionResumeInfoTempFileName";
pub const INFO_VERSION_KEY: &str = "NSURLSessionResumeInfoVersion";
pub const ENTITY_TAG_KEY: &str = "NSURLSessionResumeEntityTag";
pub const SERVER_DATE_KEY: &str = "NSURLSessionResumeServerDownloadDate";
pub const CURRENT_REQUEST_KEY: &str = "NSURLSessionResumeCurrentRequest";
pub const ORIGINAL_REQUEST_KEY: &str = "NSURLSessionResumeOriginalRequest";

const INFO_VERSION: u64 = 2;
const REQUEST_TIMEOUT_SECS: f64 = 60.0;

/// Everything needed to continue a partially completed download
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeData {
    /// Request URL, including the transfer's `tag` parameter
    pub url: Url,
    pub bytes_received: u64,
    /// Partial file name inside the session directory
    pub temp_file_name: String,
    pub entity_tag: Option<String>,
    pub last_modified: Option<String>,
}

impl ResumeData {
    /// Encode as a binary property list with embedded request archives
    pub fn encode(&self) -> Result<Vec<u8>, BgdlError> {
        let request = archive::encode_request(&self.url, "GET", REQUEST_TIMEOUT_SECS)?;

        let mut dict = Dictionary::new();
        dict.insert(DOWNLOAD_URL_KEY.to_string(), Value::String(self.url.to_string()));
        dict.insert(
            BYTES_RECEIVED_KEY.to_string(),
            Value::Integer(self.bytes_received.into()),
        );
        dict.insert(
            TEMP_FILE_NAME_KEY.to_string(),
            Value::String(self.temp_file_name.clone()),
        );
        dict.insert(INFO_VERSION_KEY.to_string(), Value::Integer(INFO_VERSION.into()));
        if let Some(tag) = &self.entity_tag {
            dict.insert(ENTITY_TAG_KEY.to_string(), Value::String(tag.clone()));
        }
        if let Some(date) = &self.last_modified {
            dict.insert(SERVER_DATE_KEY.to_string(), Value::String(date.clone()));
        }
        dict.insert(CURRENT_REQUEST_KEY.to_string(), Value::Data(request.clone()));
        dict.insert(ORIGINAL_REQUEST_KEY.to_string(), Value::Data(request));

        archive::to_binary(&Value::Dictionary(dict))
    }

    /// Decode resume data strictly, as the resume path needs it.
    ///
    /// The embedded request archives must be canonical; the request URL is
    /// taken from the current request.
    pub fn decode(bytes: &[u8]) -> Result<Self, BgdlError> {
        let dict = archive::resume_dictionary(bytes)?;

        let request = dict
            .get(CURRENT_REQUEST_KEY)
            .or_else(|| dict.get(ORIGINAL_REQUEST_KEY))
            .and_then(Value::as_data)
            .ok_or_else(|| BgdlError::InvalidResumeData("missing request".to_string()))?;
        let url = archive::decode_request(request)?;

        let temp_file_name = dict
            .get(TEMP_FILE_NAME_KEY)
            .and_then(Value::as_string)
            .ok_or_else(|| BgdlError::InvalidResumeData("missing temp file name".to_string()))?
            .to_string();
        if !is_plain_file_name(&temp_file_name) {
            return Err(BgdlError::InvalidResumeData(format!(
                "bad temp file name {temp_file_name}"
            )));
        }

        Ok(Self {
            url,
            bytes_received: dict
                .get(BYTES_RECEIVED_KEY)
                .and_then(Value::as_unsigned_integer)
                .unwrap_or(0),
            temp_file_name,
            entity_tag: string_field(&dict, ENTITY_TAG_KEY),
            last_modified: string_field(&dict, SERVER_DATE_KEY),
        })
    }
}

/// Lenient view of a token for listings: URL and byte count only
pub fn inspect(bytes: &[u8]) -> Option<(Option<String>, Option<u64>)> {
    let dict = archive::resume_dictionary(bytes).ok()?;
    Some((
        string_field(&dict, DOWNLOAD_URL_KEY),
        dict.get(BYTES_RECEIVED_KEY)
            .and_then(Value::as_unsigned_integer),
    ))
}

/// Partial file name a token refers to, if it names one we would have written
pub fn temp_file_name(bytes: &[u8]) -> Option<String> {
    let dict = archive::resume_dictionary(bytes).ok()?;
    string_field(&dict, TEMP_FILE_NAME_KEY).filter(|name| is_plain_file_name(name))
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.starts_with('.')
}

fn string_field(dict: &Dictionary, key: &str) -> Option<String> {
    dict.get(key).and_then(Value::as_string).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResumeData {
        ResumeData {
            url: Url::parse("http://host/path/file.zip?tag=3").unwrap(),
            bytes_received: 1024,
            temp_file_name: "1b4e28ba.part".to_string(),
            entity_tag: Some("\"abc\"".to_string()),
            last_modified: None,
        }
    }

    #[test]
    fn test_decode_reads_what_encode_wrote() {
        let data = sample();
        let decoded = ResumeData::decode(&data.encode().unwrap()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_decode_rejects_path_traversal() {
        let mut data = sample();
        data.temp_file_name = "../../etc/passwd".to_string();
        assert!(ResumeData::decode(&data.encode().unwrap()).is_err());
    }

    #[test]
    fn test_temp_file_name() {
        assert_eq!(
            temp_file_name(&sample().encode().unwrap()).as_deref(),
            Some("1b4e28ba.part")
        );
        let mut data = sample();
        data.temp_file_name = "../escape".to_string();
        assert!(temp_file_name(&data.encode().unwrap()).is_none());
        assert!(temp_file_name(b"garbage").is_none());
    }

    #[test]
    fn test_inspect_garbage() {
        assert!(inspect(b"not a plist").is_none());
        let (url, bytes) = inspect(&sample().encode().unwrap()).unwrap();
        assert_eq!(url.as_deref(), Some("http://host/path/file.zip?tag=3"));
        assert_eq!(bytes, Some(1024));
    }
}
