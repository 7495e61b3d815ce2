//! 动作定义与参数绑定
//!
//! 配置中的 `[[actions]]` 在加载时编译为 ActionSchema：校验主题模板里的占位符都已声明，
//! 调用时按参数定义补默认值、检查必填与类型，插值主题并按 payload_path 组装载荷。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::ResponseFormat;
use crate::core::BridgeError;
use crate::transport::validate_topic;

/// 参数类型；字符串输入会按类型尝试转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    /// 不做类型检查
    Any,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    /// 载荷中的位置，点号分隔（如 `query.city`）；未设置时放在顶层同名字段
    #[serde(default)]
    pub payload_path: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// [[actions]] 配置项
#[derive(Debug, Clone, Deserialize)]
pub struct ActionDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// 主题模板，`{param}` 为占位符
    pub topic: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// 覆盖全局回复超时
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 覆盖全局 async_mode
    #[serde(default)]
    pub async_mode: Option<bool>,
}

/// 绑定结果
#[derive(Debug, Clone, PartialEq)]
pub struct BoundAction {
    pub topic: String,
    pub payload: Value,
}

fn placeholder_regex() -> Result<&'static Regex, BridgeError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}"))
        .as_ref()
        .map_err(|e| BridgeError::ConfigError(format!("placeholder pattern: {e}")))
}

/// 编译后的动作
#[derive(Debug, Clone)]
pub struct ActionSchema {
    definition: ActionDefinition,
    placeholders: Vec<String>,
    /// 与 parameters 一一对应；None 表示只出现在主题中，不写入载荷
    payload_slots: Vec<Option<Vec<String>>>,
}

impl ActionSchema {
    pub fn compile(definition: ActionDefinition) -> Result<Self, BridgeError> {
        let invalid = |reason: String| {
            BridgeError::ConfigError(format!("action '{}': {reason}", definition.name))
        };

        if definition.name.trim().is_empty() {
            return Err(BridgeError::ConfigError("action name must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for param in &definition.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(invalid(format!("duplicate parameter '{}'", param.name)));
            }
        }

        let re = placeholder_regex()?;
        let placeholders: Vec<String> = re
            .captures_iter(&definition.topic)
            .map(|c| c[1].to_string())
            .collect();
        for name in &placeholders {
            if !seen.contains(name.as_str()) {
                return Err(invalid(format!("topic placeholder '{{{name}}}' is not a declared parameter")));
            }
        }

        let sample = re.replace_all(&definition.topic, "x");
        if sample.contains('{') || sample.contains('}') {
            return Err(invalid(format!("malformed topic template '{}'", definition.topic)));
        }
        validate_topic(&sample).map_err(|e| invalid(e.to_string()))?;

        let mut payload_slots = Vec::with_capacity(definition.parameters.len());
        for param in &definition.parameters {
            let slot = match &param.payload_path {
                Some(path) => Some(parse_payload_path(path).map_err(&invalid)?),
                None if placeholders.contains(&param.name) => None,
                None => Some(vec![param.name.clone()]),
            };
            payload_slots.push(slot);
        }
        for (i, a) in payload_slots.iter().enumerate() {
            let Some(a) = a else { continue };
            for b in payload_slots[i + 1..].iter().flatten() {
                if a.starts_with(b) || b.starts_with(a) {
                    return Err(invalid(format!(
                        "payload paths '{}' and '{}' overlap",
                        a.join("."),
                        b.join(".")
                    )));
                }
            }
        }

        Ok(Self {
            definition,
            placeholders,
            payload_slots,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &ActionDefinition {
        &self.definition
    }

    pub fn response_format(&self) -> ResponseFormat {
        self.definition.response_format
    }

    /// 绑定调用参数：补默认值、检查必填与类型、插值主题、组装载荷
    pub fn bind(&self, params: &Map<String, Value>) -> Result<BoundAction, BridgeError> {
        let mut values: Vec<(usize, &ParameterSpec, Value)> = Vec::new();
        for (idx, spec) in self.definition.parameters.iter().enumerate() {
            let value = match params.get(&spec.name) {
                Some(Value::Null) | None => spec.default.clone(),
                Some(v) => Some(v.clone()),
            };
            match value {
                Some(v) => values.push((idx, spec, coerce(spec, v)?)),
                None if spec.required => {
                    return Err(BridgeError::InvalidParameter {
                        name: spec.name.clone(),
                        reason: "required parameter is missing".into(),
                    })
                }
                None => {}
            }
        }

        for name in params.keys() {
            if !self.definition.parameters.iter().any(|p| &p.name == name) {
                tracing::debug!(action = %self.definition.name, param = %name, "ignoring undeclared parameter");
            }
        }

        let mut topic = self.definition.topic.clone();
        for name in &self.placeholders {
            let Some((_, _, value)) = values.iter().find(|(_, spec, _)| &spec.name == name) else {
                return Err(BridgeError::InvalidParameter {
                    name: name.clone(),
                    reason: "topic placeholder has no value".into(),
                });
            };
            let level = topic_level(name, value)?;
            topic = topic.replace(&format!("{{{name}}}"), &level);
        }

        let mut payload = Value::Object(Map::new());
        for (idx, _, value) in values {
            if let Some(Some(segments)) = self.payload_slots.get(idx) {
                set_path(&mut payload, segments, value)?;
            }
        }

        Ok(BoundAction { topic, payload })
    }
}

fn type_error(spec: &ParameterSpec, value: &Value) -> BridgeError {
    BridgeError::InvalidParameter {
        name: spec.name.clone(),
        reason: format!("expected {:?}, got {value}", spec.kind),
    }
}

fn coerce(spec: &ParameterSpec, value: Value) -> Result<Value, BridgeError> {
    let ok = match (spec.kind, &value) {
        (ParamKind::Any, _) => true,
        (ParamKind::String, Value::String(_)) => true,
        (ParamKind::String, Value::Number(n)) => return Ok(Value::String(n.to_string())),
        (ParamKind::Integer, Value::Number(n)) => n.is_i64() || n.is_u64(),
        (ParamKind::Integer, Value::String(s)) => {
            return s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| type_error(spec, &value))
        }
        (ParamKind::Number, Value::Number(_)) => true,
        (ParamKind::Number, Value::String(s)) => {
            return s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| type_error(spec, &value))
        }
        (ParamKind::Boolean, Value::Bool(_)) => true,
        (ParamKind::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => false,
        },
        (ParamKind::Object, Value::Object(_)) => true,
        (ParamKind::Array, Value::Array(_)) => true,
        _ => false,
    };
    if ok {
        Ok(value)
    } else {
        Err(type_error(spec, &value))
    }
}

/// 主题中的一层：不能为空，不能含分隔符或通配符
fn topic_level(name: &str, value: &Value) -> Result<String, BridgeError> {
    let level = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => {
            return Err(BridgeError::InvalidParameter {
                name: name.to_string(),
                reason: "only scalar values can be used in a topic".into(),
            })
        }
    };
    if level.is_empty() || level.contains(['/', '*', '>']) {
        return Err(BridgeError::InvalidParameter {
            name: name.to_string(),
            reason: format!("'{level}' is not a valid topic level"),
        });
    }
    Ok(level)
}

/// 拆分点号路径；空段视为配置错误
fn parse_payload_path(path: &str) -> Result<Vec<String>, String> {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(|s| s.trim().is_empty()) {
        return Err(format!("invalid payload_path '{path}'"));
    }
    Ok(segments)
}

/// 按路径写入，中间节点不存在则创建对象
fn set_path(root: &mut Value, segments: &[String], value: Value) -> Result<(), BridgeError> {
    let crosses = || {
        BridgeError::ConfigError(format!(
            "payload_path '{}' crosses a non-object value",
            segments.join(".")
        ))
    };
    let Some((last, parents)) = segments.split_last() else {
        return Err(BridgeError::ConfigError("empty payload_path".into()));
    };
    let mut current = root;
    for segment in parents {
        let Value::Object(map) = current else {
            return Err(crosses());
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let Value::Object(map) = current else {
        return Err(crosses());
    };
    map.insert(last.clone(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn param(name: &str, kind: ParamKind) -> ParameterSpec {
        ParameterSpec {
            name: name.into(),
            kind,
            required: false,
            default: None,
            payload_path: None,
            description: None,
        }
    }

    fn weather() -> ActionSchema {
        let mut city = param("city", ParamKind::String);
        city.required = true;
        let mut units = param("units", ParamKind::String);
        units.default = Some(json!("metric"));
        units.payload_path = Some("options.units".into());
        let days = param("days", ParamKind::Integer);
        ActionSchema::compile(ActionDefinition {
            name: "weather".into(),
            description: None,
            topic: "agents/weather/{city}".into(),
            parameters: vec![city, units, days],
            response_format: ResponseFormat::Json,
            timeout_ms: None,
            async_mode: None,
        })
        .unwrap()
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_bind_interpolates_and_places_payload() {
        let bound = weather()
            .bind(&params(json!({"city": "Paris", "days": "3"})))
            .unwrap();
        assert_eq!(bound.topic, "agents/weather/Paris");
        assert_eq!(bound.payload, json!({"options": {"units": "metric"}, "days": 3}));
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = weather().bind(&Map::new()).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameter { ref name, .. } if name == "city"));
    }

    #[test]
    fn test_type_mismatch_and_wildcard_injection() {
        let err = weather()
            .bind(&params(json!({"city": "Paris", "days": "soon"})))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameter { ref name, .. } if name == "days"));

        let err = weather()
            .bind(&params(json!({"city": "a/>"})))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidParameter { .. }));
    }

    #[test]
    fn test_undeclared_placeholder_fails_compile() {
        let result = ActionSchema::compile(ActionDefinition {
            name: "bad".into(),
            description: None,
            topic: "agents/{region}/forecast".into(),
            parameters: vec![],
            response_format: ResponseFormat::Text,
            timeout_ms: None,
            async_mode: None,
        });
        assert!(matches!(result, Err(BridgeError::ConfigError(_))));
    }

    fn with_paths(paths: &[&str]) -> Result<ActionSchema, BridgeError> {
        let parameters = paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let mut p = param(&format!("p{i}"), ParamKind::Any);
                p.payload_path = Some(path.to_string());
                p
            })
            .collect();
        ActionSchema::compile(ActionDefinition {
            name: "paths".into(),
            description: None,
            topic: "agents/paths".into(),
            parameters,
            response_format: ResponseFormat::Json,
            timeout_ms: None,
            async_mode: None,
        })
    }

    #[test]
    fn test_bad_payload_path_fails_compile() {
        let err = with_paths(&["options..units"]).unwrap_err();
        assert!(matches!(err, BridgeError::ConfigError(ref msg) if msg.contains("options..units")));
        assert!(with_paths(&[".units"]).is_err());
        assert!(with_paths(&["units."]).is_err());
    }

    #[test]
    fn test_overlapping_payload_paths_fail_compile() {
        assert!(matches!(with_paths(&["a", "a.b"]), Err(BridgeError::ConfigError(_))));
        assert!(matches!(with_paths(&["q.city", "q.city"]), Err(BridgeError::ConfigError(_))));

        // 顶层同名字段也参与冲突检查
        let mut nested = param("x", ParamKind::Any);
        nested.payload_path = Some("days.max".into());
        let result = ActionSchema::compile(ActionDefinition {
            name: "clash".into(),
            description: None,
            topic: "agents/clash".into(),
            parameters: vec![param("days", ParamKind::Integer), nested],
            response_format: ResponseFormat::Json,
            timeout_ms: None,
            async_mode: None,
        });
        assert!(matches!(result, Err(BridgeError::ConfigError(_))));

        let schema = with_paths(&["q.city", "q.units", "limit"]).unwrap();
        let bound = schema
            .bind(&params(json!({"p0": "Paris", "p1": "metric", "p2": 3})))
            .unwrap();
        assert_eq!(bound.payload, json!({"q": {"city": "Paris", "units": "metric"}, "limit": 3}));
    }

    #[test]
    fn test_placeholder_pattern_is_reused() {
        let first = placeholder_regex().unwrap();
        let second = placeholder_regex().unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(weather().definition().topic, "agents/weather/{city}");
    }

    #[test]
    fn test_set_path_rejects_conflicts() {
        let path = |p: &str| parse_payload_path(p).unwrap();
        let mut root = json!({"a": 1});
        assert!(set_path(&mut root, &path("a.b"), json!(2)).is_err());
        assert!(parse_payload_path("x..y").is_err());
        set_path(&mut root, &path("c.d.e"), json!(true)).unwrap();
        assert_eq!(root, json!({"a": 1, "c": {"d": {"e": true}}}));
    }
}
