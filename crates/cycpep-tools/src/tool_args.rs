use serde_json::Value;

/// Required non-blank string argument, trimmed.
pub(crate) fn required_string(arguments: &Value, key: &str) -> Result<String, String> {
    let value = arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| format!("missing required string argument '{key}'"))?;
    if value.is_empty() {
        return Err(format!("required argument '{key}' must not be empty"));
    }
    Ok(value.to_string())
}

/// Optional string argument; blank and `null` count as absent.
pub(crate) fn optional_string(arguments: &Value, key: &str) -> Result<Option<String>, String> {
    let Some(value) = arguments.get(key).filter(|value| !value.is_null()) else {
        return Ok(None);
    };
    let Some(raw) = value.as_str() else {
        return Err(format!("optional argument '{key}' must be a string"));
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(trimmed.to_string()))
}

/// Optional array of strings with blank entries dropped.
pub(crate) fn optional_string_array(arguments: &Value, key: &str) -> Result<Vec<String>, String> {
    let Some(value) = arguments.get(key).filter(|value| !value.is_null()) else {
        return Ok(Vec::new());
    };
    let Some(items) = value.as_array() else {
        return Err(format!("'{key}' must be an array of strings"));
    };
    let mut values = Vec::with_capacity(items.len());
    for item in items {
        let Some(raw) = item.as_str() else {
            return Err(format!("'{key}' must be an array of strings"));
        };
        let normalized = raw.trim();
        if normalized.is_empty() {
            continue;
        }
        values.push(normalized.to_string());
    }
    Ok(values)
}

/// Array of strings kept verbatim, for process arguments where blanks are meaningful.
pub(crate) fn optional_raw_string_array(
    arguments: &Value,
    key: &str,
) -> Result<Vec<String>, String> {
    let Some(value) = arguments.get(key).filter(|value| !value.is_null()) else {
        return Ok(Vec::new());
    };
    let Some(items) = value.as_array() else {
        return Err(format!("'{key}' must be an array of strings"));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("'{key}' must be an array of strings"))
        })
        .collect()
}

/// Optional non-negative integer argument.
pub(crate) fn optional_usize(arguments: &Value, key: &str, default: usize) -> Result<usize, String> {
    let Some(value) = arguments.get(key).filter(|value| !value.is_null()) else {
        return Ok(default);
    };
    let parsed = value
        .as_u64()
        .ok_or_else(|| format!("optional argument '{key}' must be a non-negative integer"))?;
    usize::try_from(parsed).map_err(|_| format!("optional argument '{key}' exceeds host usize range"))
}
