//! # Utility Functions and Helper Module
//!
//! Small helpers shared across the core: IRC-style wildcard matching for
//! ignore lists, RFC 1459 case folding, and hex formatting for checksum
//! digests.

/// Case-fold a name per RFC 1459.
///
/// ASCII letters are lowercased and the bracket characters map pairwise:
/// `[` → `{`, `]` → `}`, `\` → `|`, `~` → `^`. Channel and nick names that
/// differ only under this mapping refer to the same entity.
pub fn irc_fold(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            _ => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Returns true when two names are equal under RFC 1459 folding.
pub fn irc_eq(a: &str, b: &str) -> bool {
    irc_fold(a) == irc_fold(b)
}

/// Glob-style wildcard match with `*` (any run) and `?` (any single char).
///
/// Matching is case-insensitive in the ASCII range, which is what ignore
/// masks like `*!*@*.example.net` expect. Iterative backtracking keeps this
/// linear for the typical short hostmask inputs.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().map(|c| c.to_ascii_lowercase()).collect();
    let txt: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Backtrack: let the last `*` swallow one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// Format a binary digest as lowercase hex.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
