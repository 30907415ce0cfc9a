use crate::model::CustomCssPost;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SaveCustomCss {
    pub css: String,
}

#[derive(Debug, Serialize, Default)]
pub struct APIResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_css: Option<CustomCssPost>,
}

impl APIResponse {
    pub fn new_from_msg(msg: &str) -> Self {
        return APIResponse {
            status: msg.to_owned(),
            custom_css: None,
        };
    }

    pub fn new(msg: Option<&str>, custom_css: Option<CustomCssPost>) -> Self {
        let msg = match msg {
            Some(msg) => msg,
            None => "",
        };

        return APIResponse {
            status: msg.to_owned(),
            custom_css,
        };
    }
}
