//! 回复格式化：把扁平化后的回复内容按动作配置转换为调用方拿到的 body

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::BridgeError;
use crate::task::{ContentPart, FlattenedContent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// 结构化数据片段优先，否则把文本解析为 JSON
    Json,
    /// 文本按 YAML 解析
    Yaml,
    /// 拼接后的文本
    #[default]
    Text,
    /// 原始片段数组
    Raw,
}

impl fmt::Display for ResponseFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseFormat::Json => write!(f, "json"),
            ResponseFormat::Yaml => write!(f, "yaml"),
            ResponseFormat::Text => write!(f, "text"),
            ResponseFormat::Raw => write!(f, "raw"),
        }
    }
}

impl ResponseFormat {
    pub fn apply(
        self,
        flat: &FlattenedContent,
        parts: &[ContentPart],
    ) -> Result<Value, BridgeError> {
        match self {
            ResponseFormat::Json => {
                if let Some(data) = structured(flat) {
                    return Ok(data);
                }
                let text = flat.text.trim();
                if text.is_empty() {
                    return Ok(Value::Null);
                }
                serde_json::from_str(text).map_err(|e| BridgeError::ResponseFormat {
                    format: self,
                    detail: e.to_string(),
                })
            }
            ResponseFormat::Yaml => {
                if let Some(data) = structured(flat) {
                    return Ok(data);
                }
                if flat.text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                serde_yaml::from_str(&flat.text).map_err(|e| BridgeError::ResponseFormat {
                    format: self,
                    detail: e.to_string(),
                })
            }
            ResponseFormat::Text => Ok(Value::String(flat.text.clone())),
            ResponseFormat::Raw => {
                serde_json::to_value(parts).map_err(|e| BridgeError::ResponseFormat {
                    format: self,
                    detail: e.to_string(),
                })
            }
        }
    }
}

fn structured(flat: &FlattenedContent) -> Option<Value> {
    match flat.data.len() {
        0 => None,
        1 => Some(flat.data[0].clone()),
        _ => Some(Value::Array(flat.data.clone())),
    }
}
