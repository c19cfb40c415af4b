//! Shared utilities: secret masking, text trimming and atomic file writes.

use std::io::Write;
use std::path::Path;

/// Mask a secret, keeping at most the first four characters.
///
/// Short secrets are hidden entirely.
pub fn mask_secret(secret: &str) -> String {
    if secret.is_empty() {
        return String::new();
    }
    let visible: String = secret.chars().take(4).collect();
    if secret.chars().count() <= 8 {
        "***".to_string()
    } else {
        format!("{visible}***")
    }
}

/// Mask everything after the host of a URL.
///
/// Webhook URLs carry their credential in the path, so only the scheme and
/// host survive.
pub fn mask_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return mask_secret(url);
    };
    let after_scheme = &url[scheme_end + 3..];
    let host_end = after_scheme
        .find(['/', '?', '#'])
        .unwrap_or(after_scheme.len());
    let host = &after_scheme[..host_end];
    // Userinfo is a credential as well.
    let host = host.rsplit('@').next().unwrap_or(host);
    if host_end == after_scheme.len() {
        format!("{}://{}", &url[..scheme_end], host)
    } else {
        format!("{}://{}/***", &url[..scheme_end], host)
    }
}

fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }
        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }
        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }
        if c == '"' || c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }
        if c.is_whitespace() {
            break;
        }
        end += char_len;
    }
    end
}

/// Mask credential-looking assignments and flags in a shell command before logging.
pub fn mask_sensitive_command(cmd: &str) -> String {
    const PATTERNS: &[&str] = &[
        "HF_TOKEN=",
        "HUGGING_FACE_HUB_TOKEN=",
        "VLLM_API_KEY=",
        "API_KEY=",
        "TOKEN=",
        "PASSWORD=",
        "SECRET=",
        "--api-key ",
        "--api-key=",
        "--token ",
        "--token=",
        "--password ",
        "--password=",
    ];

    let mut result = cmd.to_string();
    for pattern in PATTERNS {
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + start;
            let value_start = abs_start + pattern.len();
            let value_end = value_start + find_value_end(&result[value_start..]);
            if value_end == value_start {
                search_start = value_start;
                continue;
            }
            result = format!("{}***{}", &result[..value_start], &result[value_end..]);
            search_start = value_start + 3;
        }
    }
    result
}

/// The last `n` lines of `text`.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Truncate to at most `max` bytes on a char boundary, appending an ellipsis when cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Write through a sibling `<name>.tmp` file and rename it over `path`.
///
/// Missing parent directories are created. Readers see either the old
/// contents or the new ones, never a partial file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);
    {
        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp_path, path)
}
