use chrono::{NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Storage format of `modified_gmt`, always UTC.
pub const MODIFIED_GMT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The custom CSS document of one theme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomCssPost {
    pub id: i64,
    pub theme: String,
    pub css: String,
    pub modified_gmt: String,
}

impl CustomCssPost {
    /// Unix timestamp of the last modification, `None` when the stored value is malformed.
    pub fn modified_timestamp(&self) -> Option<i64> {
        NaiveDateTime::parse_from_str(&self.modified_gmt, MODIFIED_GMT_FORMAT)
            .ok()
            .map(|dt| Utc.from_utc_datetime(&dt).timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post(modified_gmt: &str) -> CustomCssPost {
        CustomCssPost {
            id: 1,
            theme: "mytheme".to_string(),
            css: String::new(),
            modified_gmt: modified_gmt.to_string(),
        }
    }

    #[test]
    fn test_modified_timestamp() {
        assert_eq!(post("2000-01-01 00:00:00").modified_timestamp(), Some(946684800));
        assert_eq!(post("2017-03-04 12:30:00").modified_timestamp(), Some(1488630600));
        assert_eq!(post("yesterday").modified_timestamp(), None);
    }
}
