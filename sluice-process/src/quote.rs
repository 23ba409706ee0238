//! Command-line rendering for both shell families.
//!
//! Both algorithms are compiled on every platform: the echo option renders
//! with whichever matches the target, but tests (and tools that build
//! remote command lines) may want either.

/// Characters that never need quoting under a POSIX shell.
fn posix_safe(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'/' | b':' | b'=' | b'@')
}

/// Quote one word for a POSIX shell.
///
/// Safe words pass through untouched; everything else is wrapped in single
/// quotes, with embedded single quotes spliced out as `'\''`. The empty
/// string renders as `''`.
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty() && word.bytes().all(posix_safe) {
        return word.to_owned();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('\'');
    for ch in word.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Join a program and its arguments into one POSIX shell command line.
pub fn shell_join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for word in words {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(&shell_quote(word.as_ref()));
    }
    out
}

/// Join a program and its arguments into a single Windows command line
/// that `CreateProcessW` argument parsing splits back into the same argv.
///
/// The rules are the CRT's: a word is quoted when empty or containing
/// whitespace or a quote; inside quotes, a run of N backslashes before a
/// quote becomes 2N (+1 for the quote itself) backslashes, and trailing
/// backslashes double so the closing quote survives.
pub fn windows_command_line<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for word in words {
        let word = word.as_ref();
        if !out.is_empty() {
            out.push(' ');
        }
        let needs_quotes =
            word.is_empty() || word.chars().any(|c| matches!(c, ' ' | '\t' | '\n' | '"'));
        if !needs_quotes {
            out.push_str(word);
            continue;
        }

        out.push('"');
        let mut backslashes = 0usize;
        for ch in word.chars() {
            match ch {
                '\\' => backslashes += 1,
                '"' => {
                    // Each pending backslash must escape itself, then one
                    // more escapes the quote.
                    out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                    out.push('"');
                    backslashes = 0;
                }
                _ => {
                    out.extend(std::iter::repeat('\\').take(backslashes));
                    out.push(ch);
                    backslashes = 0;
                }
            }
        }
        // Trailing backslashes double so they cannot escape the closing
        // quote.
        out.extend(std::iter::repeat('\\').take(backslashes * 2));
        out.push('"');
    }
    out
}
