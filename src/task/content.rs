//! 内容片段与扁平化

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 文件引用（内容本身由外部的制品存储负责）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// 请求或回复中的一个片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    File { file: FileRef },
    Data { data: Value },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn file(file: FileRef) -> Self {
        ContentPart::File { file }
    }

    pub fn data(data: Value) -> Self {
        ContentPart::Data { data }
    }
}

/// 扁平化结果：文本按换行拼接，文件与结构化数据原样收集
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlattenedContent {
    pub text: String,
    pub files: Vec<FileRef>,
    pub data: Vec<Value>,
}

impl FlattenedContent {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.files.is_empty() && self.data.is_empty()
    }
}

pub fn flatten(parts: &[ContentPart]) -> FlattenedContent {
    let mut out = FlattenedContent::default();
    let mut texts: Vec<&str> = Vec::new();
    for part in parts {
        match part {
            ContentPart::Text { text } => texts.push(text),
            ContentPart::File { file } => out.files.push(file.clone()),
            ContentPart::Data { data } => out.data.push(data.clone()),
        }
    }
    out.text = texts.join("\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flatten_mixed_parts() {
        let parts = vec![
            ContentPart::text("line one"),
            ContentPart::file(FileRef {
                name: "chart.png".into(),
                uri: "s3://bucket/chart.png".into(),
                mime_type: Some("image/png".into()),
            }),
            ContentPart::data(json!({"temp": 18})),
            ContentPart::text("line two"),
        ];
        let flat = flatten(&parts);
        assert_eq!(flat.text, "line one\nline two");
        assert_eq!(flat.files.len(), 1);
        assert_eq!(flat.data, vec![json!({"temp": 18})]);
    }

    #[test]
    fn test_wire_shape() {
        let part: ContentPart =
            serde_json::from_value(json!({"kind": "text", "text": "hi"})).unwrap();
        assert_eq!(part, ContentPart::text("hi"));
        assert!(flatten(&[]).is_empty());
    }
}
