// Converts an upstream survey spec into the data-driven-forms schema stored
// on a service plan. The input is decoded with number preservation so min/max
// thresholds and defaults keep their exact numeric form.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use towersync_models::SurveyConverter;

#[derive(Debug, Deserialize)]
struct SurveySpec {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, rename = "spec")]
    fields: Vec<SurveyField>,
}

#[derive(Debug, Deserialize)]
struct SurveyField {
    #[serde(default)]
    question_name: String,
    #[serde(default)]
    question_description: String,
    #[serde(default)]
    required: bool,
    #[serde(default, rename = "type")]
    field_type: String,
    #[serde(default)]
    variable: String,
    #[serde(default)]
    min: Value,
    #[serde(default)]
    max: Value,
    #[serde(default)]
    default: Value,
    #[serde(default)]
    choices: Value,
}

#[derive(Debug, Serialize)]
struct DdfField {
    name: String,
    label: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    component: String,
    #[serde(rename = "helperText", skip_serializing_if = "String::is_empty")]
    helper_text: String,
    #[serde(rename = "initialValue")]
    initial_value: Value,
    #[serde(rename = "isRequired")]
    is_required: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    validate: Vec<Value>,
    #[serde(rename = "dataType", skip_serializing_if = "String::is_empty")]
    data_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Vec<Value>>,
    #[serde(rename = "type", skip_serializing_if = "String::is_empty")]
    input_type: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    multi: bool,
}

#[derive(Debug, Serialize)]
struct DdfSchema {
    title: String,
    description: String,
    fields: Vec<DdfField>,
}

#[derive(Debug, Serialize)]
struct DdfSpec {
    schema: DdfSchema,
    #[serde(rename = "schemaType")]
    schema_type: &'static str,
}

/// The converter handed to the plan repository.
#[derive(Debug, Default, Clone, Copy)]
pub struct DdfConverter;

impl SurveyConverter for DdfConverter {
    fn convert(&self, spec: &[u8]) -> anyhow::Result<Vec<u8>> {
        convert(spec)
    }
}

/// Transform a raw survey-spec document into form-schema JSON bytes.
/// Field order is preserved.
pub fn convert(spec: &[u8]) -> anyhow::Result<Vec<u8>> {
    let survey: SurveySpec = serde_json::from_slice(spec)?;

    let mut fields = Vec::with_capacity(survey.fields.len());
    for field in &survey.fields {
        fields.push(ddf_field(field)?);
    }

    let out = DdfSpec {
        schema: DdfSchema {
            title: survey.name,
            description: survey.description,
            fields,
        },
        schema_type: "default",
    };
    Ok(serde_json::to_vec(&out)?)
}

fn ddf_field(field: &SurveyField) -> anyhow::Result<DdfField> {
    let mut ddf = DdfField {
        name: field.variable.clone(),
        label: field.question_name.clone(),
        component: String::new(),
        helper_text: field.question_description.clone(),
        initial_value: field.default.clone(),
        is_required: field.required,
        validate: validators(field),
        data_type: String::new(),
        options: options(&field.choices),
        input_type: String::new(),
        multi: false,
    };

    match field.field_type.as_str() {
        "text" => ddf.component = "text-field".into(),
        "textarea" => ddf.component = "textarea-field".into(),
        "password" => {
            ddf.component = "text-field".into();
            ddf.input_type = "password".into();
        }
        "integer" => {
            ddf.component = "text-field".into();
            ddf.input_type = "number".into();
            ddf.data_type = "integer".into();
        }
        "float" => {
            ddf.component = "text-field".into();
            ddf.input_type = "number".into();
            ddf.data_type = "float".into();
        }
        "multiplechoice" => ddf.component = "select-field".into(),
        "multiselect" => {
            ddf.component = "select-field".into();
            ddf.multi = true;
        }
        other => bail!("Unsupported field type {other}"),
    }

    Ok(ddf)
}

fn is_textual(field_type: &str) -> bool {
    matches!(field_type, "text" | "password" | "textarea")
}

fn is_numeric(field_type: &str) -> bool {
    matches!(field_type, "integer" | "float")
}

fn validators(field: &SurveyField) -> Vec<Value> {
    let mut result = Vec::new();
    if field.required {
        result.push(json!({"type": "required-validator"}));
    }
    if let Some(bound) = bound_validator(&field.field_type, &field.min, "min") {
        result.push(bound);
    }
    if let Some(bound) = bound_validator(&field.field_type, &field.max, "max") {
        result.push(bound);
    }
    result
}

fn bound_validator(field_type: &str, value: &Value, which: &str) -> Option<Value> {
    let Value::Number(n) = value else {
        return None;
    };
    if is_textual(field_type) {
        Some(json!({"type": format!("{which}-length-validator"), "threshold": n}))
    } else if is_numeric(field_type) {
        Some(json!({"type": format!("{which}-number-value"), "value": n}))
    } else {
        None
    }
}

fn options(choices: &Value) -> Option<Vec<Value>> {
    let values: Vec<&str> = match choices {
        Value::String(s) if !s.is_empty() => s.split('\n').collect(),
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => return None,
    };

    let result: Vec<Value> = values
        .into_iter()
        .filter(|v| !v.is_empty())
        .map(|v| json!({"label": v, "value": v}))
        .collect();

    if result.is_empty() {
        None
    } else {
        Some(result)
    }
}
