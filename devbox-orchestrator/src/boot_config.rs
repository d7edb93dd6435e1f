//! First-boot configuration repair for replacement instances.
//!
//! The boot-config blob is a base64 NixOS module. Before it is reused on a replacement we make
//! sure it can rebuild on first boot: the module takes `modulesPath`, imports
//! `virtualisation/amazon-image.nix`, and sets `networking.hostName`.
//!
//! The module is parsed into a header (the argument set) and a body (the attribute set) with
//! its top-level bindings located by a small lexer that skips comments and string literals.
//! Anything that does not parse as `{ config, pkgs, ... }: { ... }` is passed through untouched.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::ops::Range;

const AMAZON_IMAGE_IMPORT: &str = "\"${modulesPath}/virtualisation/amazon-image.nix\"";

/// What `patch_module` had to add.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchSummary {
    pub added_modules_path_arg: bool,
    pub added_amazon_image_import: bool,
    pub added_hostname: bool,
}

impl PatchSummary {
    pub fn changed(&self) -> bool {
        self.added_modules_path_arg || self.added_amazon_image_import || self.added_hostname
    }
}

/// Patch a base64 boot-config blob. Blobs that are not base64-encoded NixOS modules are
/// returned unchanged.
pub fn patch_boot_config(blob_b64: &str, hostname: &str) -> String {
    let decoded = match STANDARD.decode(blob_b64.trim()) {
        Ok(bytes) => bytes,
        Err(_) => {
            tracing::debug!("🧩 [boot-config] blob is not base64, leaving it alone");
            return blob_b64.to_string();
        }
    };
    let Ok(text) = String::from_utf8(decoded) else {
        return blob_b64.to_string();
    };
    match patch_module(&text, hostname) {
        Some((patched, summary)) if summary.changed() => {
            tracing::info!("🧩 [boot-config] patched boot config: {:?}", summary);
            STANDARD.encode(patched.as_bytes())
        }
        Some(_) => blob_b64.to_string(),
        None => {
            tracing::debug!("🧩 [boot-config] not a NixOS module, leaving it alone");
            blob_b64.to_string()
        }
    }
}

/// Patch module source. `None` when the text is not a recognisable NixOS module.
pub fn patch_module(text: &str, hostname: &str) -> Option<(String, PatchSummary)> {
    let module = NixModule::parse(text)?;
    let mut summary = PatchSummary::default();

    let header = if module.args.iter().any(|a| a.name == "modulesPath") {
        text[module.header.clone()].to_string()
    } else {
        summary.added_modules_path_arg = true;
        module.header_with_arg("modulesPath")
    };

    let body = &text[module.body.clone()];
    let bindings = Binding::scan(body)?;
    let imports = bindings.iter().find(|b| b.path == "imports");
    let has_hostname = bindings.iter().any(|b| {
        b.path == "networking.hostName"
            || (b.path == "networking" && body[b.value.clone()].contains("hostName"))
    });

    // (offset into body, text to insert)
    let mut edits: Vec<(usize, String)> = Vec::new();
    let hostname_line = format!("\n  networking.hostName = {:?};", hostname);
    match imports {
        Some(b) => {
            let value = &body[b.value.clone()];
            if !value.contains("amazon-image.nix") {
                if let Some(open) = value.find('[') {
                    edits.push((b.value.start + open + 1, format!(" {}", AMAZON_IMAGE_IMPORT)));
                    summary.added_amazon_image_import = true;
                }
            }
            if !has_hostname {
                edits.push((b.end, hostname_line));
                summary.added_hostname = true;
            }
        }
        None => {
            let mut inserted = format!("\n  imports = [ {} ];", AMAZON_IMAGE_IMPORT);
            summary.added_amazon_image_import = true;
            if !has_hostname {
                inserted.push_str(&hostname_line);
                summary.added_hostname = true;
            }
            edits.push((0, inserted));
        }
    }

    let mut new_body = body.to_string();
    edits.sort_by(|a, b| b.0.cmp(&a.0));
    for (offset, insert) in edits {
        new_body.insert_str(offset, &insert);
    }

    let mut out = String::with_capacity(text.len() + 128);
    out.push_str(&text[..module.header.start]);
    out.push_str(&header);
    out.push_str(&text[module.header.end..module.body.start]);
    out.push_str(&new_body);
    out.push_str(&text[module.body.end..]);
    Some((out, summary))
}

#[derive(Debug)]
struct Arg<'a> {
    raw: &'a str,
    name: &'a str,
}

/// `{ args }: { body }` with byte spans into the source text.
#[derive(Debug)]
struct NixModule<'a> {
    /// The argument set including its braces.
    header: Range<usize>,
    args: Vec<Arg<'a>>,
    variadic: bool,
    /// Inside of the body braces.
    body: Range<usize>,
}

impl<'a> NixModule<'a> {
    fn parse(text: &'a str) -> Option<Self> {
        let b = text.as_bytes();
        let open = skip_trivia(b, 0)?;
        if b.get(open) != Some(&b'{') {
            return None;
        }
        let close = open + 1 + text[open + 1..].find('}')?;
        let inner = &text[open + 1..close];
        if inner.contains('{') {
            return None;
        }

        let mut args = Vec::new();
        let mut variadic = false;
        for raw in inner.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if raw == "..." {
                variadic = true;
                continue;
            }
            let name = raw.split('?').next().unwrap_or(raw).trim();
            args.push(Arg { raw, name });
        }
        let has = |n: &str| args.iter().any(|a| a.name == n);
        if !(has("config") && has("pkgs")) {
            return None;
        }

        let colon = skip_trivia(b, close + 1)?;
        if b.get(colon) != Some(&b':') {
            return None;
        }
        let body_open = skip_trivia(b, colon + 1)?;
        if b.get(body_open) != Some(&b'{') {
            return None;
        }
        let body_close = matching_close(b, body_open)?;

        Some(NixModule {
            header: open..close + 1,
            args,
            variadic,
            body: body_open + 1..body_close,
        })
    }

    fn header_with_arg(&self, name: &str) -> String {
        let mut parts: Vec<&str> = self.args.iter().map(|a| a.raw).collect();
        parts.push(name);
        if self.variadic {
            parts.push("...");
        }
        format!("{{ {} }}", parts.join(", "))
    }
}

/// A top-level `path = value;` binding of the module body.
#[derive(Debug)]
struct Binding {
    path: String,
    value: Range<usize>,
    /// Just past the terminating `;`.
    end: usize,
}

impl Binding {
    fn scan(body: &str) -> Option<Vec<Binding>> {
        let b = body.as_bytes();
        let mut out = Vec::new();
        let mut depth = 0usize;
        let mut stmt_start = 0;
        let mut eq: Option<usize> = None;
        let mut i = 0;
        while let Some((pos, c)) = next_structural(b, i)? {
            match c {
                b'{' | b'[' | b'(' => depth += 1,
                b'}' | b']' | b')' => depth = depth.checked_sub(1)?,
                b'=' if depth == 0 && eq.is_none() => eq = Some(pos),
                b';' if depth == 0 => {
                    if let Some(e) = eq {
                        out.push(Binding {
                            path: strip_comments(&body[stmt_start..e]),
                            value: e + 1..pos,
                            end: pos + 1,
                        });
                    }
                    stmt_start = pos + 1;
                    eq = None;
                }
                _ => {}
            }
            i = pos + 1;
        }
        if depth != 0 {
            return None;
        }
        Some(out)
    }
}

fn strip_comments(s: &str) -> String {
    s.lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// Index of the first byte at or after `i` that is not whitespace or a comment.
fn skip_trivia(b: &[u8], mut i: usize) -> Option<usize> {
    loop {
        match b.get(i)? {
            c if c.is_ascii_whitespace() => i += 1,
            b'#' => i = line_end(b, i),
            b'/' if b.get(i + 1) == Some(&b'*') => i = block_comment_end(b, i)?,
            _ => return Some(i),
        }
    }
}

/// Index of the brace closing the one at `open`.
fn matching_close(b: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = open;
    while let Some((pos, c)) = next_structural(b, i)? {
        match c {
            b'{' | b'[' | b'(' => depth += 1,
            b'}' | b']' | b')' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return (c == b'}').then_some(pos);
                }
            }
            _ => {}
        }
        i = pos + 1;
    }
    None
}

/// Next bracket, `=` or `;` at or after `i`, skipping comments and string literals.
/// `Some(None)` at end of input; `None` on an unterminated literal.
fn next_structural(b: &[u8], mut i: usize) -> Option<Option<(usize, u8)>> {
    while let Some(&c) = b.get(i) {
        match c {
            b'#' => i = line_end(b, i),
            b'/' if b.get(i + 1) == Some(&b'*') => i = block_comment_end(b, i)?,
            b'"' => i = string_end(b, i + 1)?,
            b'\'' if b.get(i + 1) == Some(&b'\'') => i = indented_string_end(b, i + 2)?,
            b'{' | b'}' | b'[' | b']' | b'(' | b')' | b'=' | b';' => {
                // `==` and friends are operators, not bindings.
                if c == b'=' && (b.get(i + 1) == Some(&b'=') || i > 0 && b"!<>=".contains(&b[i - 1])) {
                    i += 1;
                    continue;
                }
                return Some(Some((i, c)));
            }
            _ => i += 1,
        }
    }
    Some(None)
}

fn line_end(b: &[u8], i: usize) -> usize {
    b[i..]
        .iter()
        .position(|&c| c == b'\n')
        .map_or(b.len(), |p| i + p)
}

fn block_comment_end(b: &[u8], i: usize) -> Option<usize> {
    b[i + 2..]
        .windows(2)
        .position(|w| w == b"*/")
        .map(|p| i + 2 + p + 2)
}

/// Past the closing quote of a `"..."` string whose body starts at `i`.
fn string_end(b: &[u8], mut i: usize) -> Option<usize> {
    loop {
        match b.get(i)? {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
}

/// Past the closing `''` of an indented string whose body starts at `i`.
fn indented_string_end(b: &[u8], mut i: usize) -> Option<usize> {
    loop {
        match (b.get(i)?, b.get(i + 1)) {
            (b'\'', Some(b'\'')) => {
                if matches!(b.get(i + 2), Some(b'\'') | Some(b'$') | Some(b'\\')) {
                    i += 3;
                } else {
                    return Some(i + 2);
                }
            }
            _ => i += 1,
        }
    }
}
