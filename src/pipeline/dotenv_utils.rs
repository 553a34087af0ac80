use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Key/value pairs from `<app_root>/.env`; missing file yields an empty map.
pub fn load_dotenv_map(app_root: &Path) -> Result<HashMap<String, String>, std::io::Error> {
    let path = app_root.join(".env");
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let raw = fs::read_to_string(path)?;
    Ok(parse_dotenv_content(raw.as_str()))
}

pub fn parse_dotenv_content(raw: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in raw.lines() {
        let mut entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        if let Some(rest) = entry.strip_prefix("export ") {
            entry = rest.trim_start();
        }
        let Some((key_raw, value_raw)) = entry.split_once('=') else {
            continue;
        };
        let key = key_raw.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), unquote_dotenv_value(value_raw.trim()));
    }
    out
}

fn unquote_dotenv_value(value: &str) -> String {
    let quoted = value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')));
    if quoted {
        return value[1..value.len() - 1].to_string();
    }
    match value.split_once(" #") {
        Some((before_comment, _)) => before_comment.trim_end().to_string(),
        None => value.to_string(),
    }
}

/// Process environment first, then `.env`; blank values count as unset.
pub fn lookup_env_or_dotenv(dotenv: &HashMap<String, String>, key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .or_else(|| dotenv.get(key).cloned())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_export_quotes_and_comments() {
        let parsed = parse_dotenv_content(
            "# comment\nexport GROQ_API_KEY=\"gsk-1 # not a comment\"\nHF_TOKEN='hf_x'\nMIRAGE_BIND=0.0.0.0:8017 # trailing\n=ignored\nnot a pair\n",
        );

        assert_eq!(
            parsed.get("GROQ_API_KEY").map(String::as_str),
            Some("gsk-1 # not a comment")
        );
        assert_eq!(parsed.get("HF_TOKEN").map(String::as_str), Some("hf_x"));
        assert_eq!(
            parsed.get("MIRAGE_BIND").map(String::as_str),
            Some("0.0.0.0:8017")
        );
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn lookup_falls_back_to_dotenv_and_skips_blank() {
        let mut dotenv = HashMap::new();
        dotenv.insert(
            String::from("MIRAGE_TEST_ONLY_DOTENV_KEY"),
            String::from(" value "),
        );
        dotenv.insert(String::from("MIRAGE_TEST_ONLY_BLANK_KEY"), String::from("  "));

        assert_eq!(
            lookup_env_or_dotenv(&dotenv, "MIRAGE_TEST_ONLY_DOTENV_KEY").as_deref(),
            Some("value")
        );
        assert_eq!(lookup_env_or_dotenv(&dotenv, "MIRAGE_TEST_ONLY_BLANK_KEY"), None);
    }
}
