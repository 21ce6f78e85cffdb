//! Workers compiled into the binary and run as `pypln-lite worker <name>`.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::process::Stdio;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{PyplnError, Result};
use crate::store::Document;
use crate::worker::{InputKind, WorkerSpec};

pub const DUMMY: &str = "dummy";
pub const EXTRACTOR: &str = "extractor";
pub const TOKENIZER: &str = "tokenizer";
pub const FREQDIST: &str = "freqdist";
pub const POS: &str = "pos";

/// Where the PALAVRAS tagger is installed unless `--palavras` says otherwise.
pub const DEFAULT_PALAVRAS: &str = "/opt/palavras/por.pl";

pub fn specs(exe: &Path) -> Vec<WorkerSpec> {
    let launch = |name: &str| WorkerSpec::new(name, exe).with_args(["worker", name]);
    vec![
        launch(DUMMY).with_input(InputKind::None),
        launch(EXTRACTOR).with_input(InputKind::Blob),
        launch(TOKENIZER).with_requires(["text"]),
        launch(FREQDIST).with_requires(["tokens"]),
        pos_spec(exe, Path::new(DEFAULT_PALAVRAS)),
    ]
}

/// The `pos` worker, tagging with the PALAVRAS script at `palavras`.
pub fn pos_spec(exe: &Path, palavras: &Path) -> WorkerSpec {
    WorkerSpec::new(POS, exe)
        .with_args([
            "worker".to_string(),
            POS.to_string(),
            "--palavras".to_string(),
            palavras.display().to_string(),
        ])
        .with_requires(["text"])
}

/// Run the named worker over one input value.
pub fn run(name: &str, input: &Value) -> Result<Document> {
    let updates = match name {
        DUMMY => json!({}),
        EXTRACTOR => extract(input)?,
        TOKENIZER => json!({ "tokens": tokenize(text_field(input, "text")?) }),
        FREQDIST => json!({ "freqdist": freqdist(input)? }),
        other => return Err(PyplnError::WorkerNotFound(other.to_string())),
    };
    match updates {
        Value::Object(fields) => Ok(fields),
        _ => Ok(Document::new()),
    }
}

/// Entry point of the hidden `worker` subcommand: JSON in on stdin, JSON out
/// on stdout.
pub async fn run_stdio(name: &str, palavras: &Path) -> Result<()> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    let input: Value = if raw.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(&raw)?
    };

    let updates = match name {
        POS => pos(&input, palavras).await?,
        _ => run(name, &input)?,
    };
    if !updates.is_empty() {
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer(&mut stdout, &updates)?;
        writeln!(stdout)?;
    }
    Ok(())
}

fn text_field<'a>(input: &'a Value, field: &str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| PyplnError::Worker(format!("missing text field {:?}", field)))
}

fn extract(input: &Value) -> Result<Value> {
    let contents = text_field(input, "contents")?;
    // Collapse runs of blank space the way plain-text extraction does.
    let text = contents
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    let mut updates = json!({ "text": text });
    for key in ["name", "length", "upload date"] {
        if let Some(value) = input.get(key) {
            updates[key] = value.clone();
        }
    }
    Ok(updates)
}

/// Words are runs of alphanumerics (plus inner apostrophes and hyphens);
/// every other visible character is a token of its own.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_alphanumeric() {
            word.push(c);
            continue;
        }
        let joins_word = (c == '\'' || c == '-')
            && !word.is_empty()
            && chars.peek().is_some_and(|next| next.is_alphanumeric());
        if joins_word {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
        if !c.is_whitespace() {
            tokens.push(c.to_string());
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

/// Tag `text` with PALAVRAS (`--morf`) into `[token, category]` pairs.
pub async fn pos(input: &Value, palavras: &Path) -> Result<Document> {
    let text = text_field(input, "text")?;

    let mut child = Command::new(palavras)
        .arg("--morf")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PyplnError::Worker(format!("failed to spawn {}: {}", palavras.display(), e)))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| PyplnError::Worker("tagger stdin unavailable".to_string()))?;
    let payload = text.as_bytes().to_vec();
    let writer = tokio::spawn(async move {
        // The tagger may exit before reading everything; its status says why.
        let _ = stdin.write_all(&payload).await;
    });
    let output = child.wait_with_output().await?;
    let _ = writer.await;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PyplnError::Worker(format!(
            "tagger {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    let stdout = String::from_utf8(output.stdout)
        .map_err(|_| PyplnError::Worker("tagger output is not valid UTF-8".to_string()))?;

    let tagged = parse_morf(&stdout)?;
    let mut updates = Document::new();
    updates.insert(
        "pos".to_string(),
        Value::Array(
            tagged
                .into_iter()
                .map(|(token, category)| json!([token, category]))
                .collect(),
        ),
    );
    Ok(updates)
}

/// Parse `--morf` output: a `"<token>"` line followed by indented readings,
/// each contributing one `(token, category)` pair.
pub fn parse_morf(output: &str) -> Result<Vec<(String, String)>> {
    let mut tagged = Vec::new();
    let mut token: Option<String> = None;

    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            let cohort = line.trim();
            let cohort = cohort.strip_prefix("\"<").unwrap_or(cohort);
            let cohort = cohort.strip_suffix(">\"").unwrap_or(cohort);
            token = Some(cohort.to_string());
            continue;
        }
        let Some(token) = &token else {
            return Err(PyplnError::Worker(format!(
                "reading before any token: {:?}",
                line.trim()
            )));
        };
        tagged.push((token.clone(), syntactic_category(line.trim())?));
    }
    Ok(tagged)
}

/// First word of a reading that is neither the quoted lemma nor inside a
/// `<...>` tag.
pub fn syntactic_category(reading: &str) -> Result<String> {
    strip_tags(reading)
        .split_whitespace()
        .find(|word| !word.starts_with('"'))
        .map(str::to_string)
        .ok_or_else(|| PyplnError::Worker(format!("bad reading: {:?}", reading)))
}

fn strip_tags(reading: &str) -> String {
    let mut out = String::with_capacity(reading.len());
    let mut rest = reading;
    while let Some(open) = rest.find('<') {
        let after = &rest[open + 1..];
        match after.find('>') {
            // `<>` is not a tag.
            Some(close) if close > 0 => {
                out.push_str(&rest[..open]);
                rest = &after[close + 1..];
            }
            _ => {
                out.push_str(&rest[..=open]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/// `[token, count]` pairs over lowercased tokens, most frequent first and
/// ties broken alphabetically.
fn freqdist(input: &Value) -> Result<Value> {
    let tokens = input
        .get("tokens")
        .and_then(Value::as_array)
        .ok_or_else(|| PyplnError::Worker("missing array field \"tokens\"".to_string()))?;

    let mut counts: HashMap<String, u64> = HashMap::new();
    for token in tokens.iter().filter_map(Value::as_str) {
        *counts.entry(token.to_lowercase()).or_default() += 1;
    }
    let mut pairs: Vec<(String, u64)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    Ok(Value::Array(
        pairs
            .into_iter()
            .map(|(token, count)| json!([token, count]))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_returns_nothing() {
        assert!(run(DUMMY, &json!({})).unwrap().is_empty());
    }

    #[test]
    fn extractor_normalizes_blank_space() {
        let blob = json!({
            "_id": "f1",
            "name": "zen.txt",
            "length": 40,
            "contents": "Simple  is better\n\n\tthan complex.  \n",
        });
        let updates = run(EXTRACTOR, &blob).unwrap();
        assert_eq!(updates["text"], "Simple is better\nthan complex.");
        assert_eq!(updates["name"], "zen.txt");
        assert_eq!(updates["length"], 40);
    }

    #[test]
    fn tokenizer_splits_words_and_punctuation() {
        assert_eq!(
            tokenize("Now is better than never. Don't re-read!"),
            vec!["Now", "is", "better", "than", "never", ".", "Don't", "re-read", "!"]
        );
        assert_eq!(tokenize("  "), Vec::<String>::new());
        assert_eq!(tokenize("'quoted'"), vec!["'", "quoted", "'"]);
    }

    #[test]
    fn freqdist_counts_case_insensitively() {
        let input = json!({"tokens": ["The", "cat", "the", "mat", "."]});
        let updates = run(FREQDIST, &input).unwrap();
        assert_eq!(
            updates["freqdist"],
            json!([["the", 2], [".", 1], ["cat", 1], ["mat", 1]])
        );
    }

    #[test]
    fn category_skips_lemma_and_tags() {
        assert_eq!(syntactic_category(r#" "a" b"#).unwrap(), "b");
        assert_eq!(syntactic_category(r#" "a" b c"#).unwrap(), "b");
        assert_eq!(syntactic_category(r#" "a" <*> b c"#).unwrap(), "b");
        assert_eq!(syntactic_category(r#" "a" <q w c s> b c"#).unwrap(), "b");
        assert!(syntactic_category(r#" "a" <x>"#).is_err());
    }

    #[test]
    fn morf_output_pairs_tokens_with_categories() {
        let output = "\"<O>\"\n\t\"o\" <artd> DET M S\n\"<gato>\"\n\t\"gato\" <an> N M S\n\n\"<.>\"\n\t\".\" PU\n";
        assert_eq!(
            parse_morf(output).unwrap(),
            vec![
                ("O".to_string(), "DET".to_string()),
                ("gato".to_string(), "N".to_string()),
                (".".to_string(), "PU".to_string()),
            ]
        );
        assert!(parse_morf("  \"o\" DET\n").is_err());
    }

    #[tokio::test]
    async fn pos_runs_the_tagger() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tagger = dir.path().join("por.pl");
        std::fs::write(
            &tagger,
            "#!/bin/sh\n[ \"$1\" = --morf ] || exit 2\nfor w in $(cat); do printf '\"<%s>\"\\n\\t\"%s\" <x> N\\n' \"$w\" \"$w\"; done\n",
        )
        .unwrap();
        std::fs::set_permissions(&tagger, std::fs::Permissions::from_mode(0o755)).unwrap();

        let updates = pos(&json!({"text": "um gato"}), &tagger).await.unwrap();
        assert_eq!(updates["pos"], json!([["um", "N"], ["gato", "N"]]));

        let missing = pos(&json!({"text": "x"}), &dir.path().join("nope")).await;
        assert!(matches!(missing, Err(PyplnError::Worker(ref m)) if m.contains("failed to spawn")));
    }

    #[test]
    fn missing_input_fields_fail() {
        assert!(matches!(
            run(TOKENIZER, &json!({"_id": "d1"})),
            Err(PyplnError::Worker(_))
        ));
        assert!(matches!(
            run("palavras", &json!({})),
            Err(PyplnError::WorkerNotFound(_))
        ));
    }
}
