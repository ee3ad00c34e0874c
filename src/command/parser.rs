//! The command file parser.
//!
//! Grammar, per logical line after comment stripping (`#` to end of line,
//! outside quotes):
//!
//! ```text
//! MACRO name = token ...        define/overwrite a short macro
//! LONG MACRO name               define/overwrite a long macro,
//!   <body lines>                  one token vector per body line,
//! END MACRO                       until END MACRO
//! INCLUDE path                  inline the file, once per top-level parse
//! anything else                 a command line, emitted after expansion
//! ```
//!
//! A token of the form `name()` is a macro call. Short macros splice their
//! tokens in place; a long macro call replaces its line with one line per
//! body line, each wrapped in the call site's prefix and suffix tokens.
//! Expansion iterates to a fixpoint. The work list carries a `pending` flag
//! per line and the loop recomputes the outstanding count from those flags
//! every round, so the flags and the count cannot fall out of sync.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::command::CommandSink;

static MACRO_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_\-]*)\(\)$").unwrap());
static MACRO_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").unwrap());

/// A command file could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read command file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}:{line}: unterminated quoted token")]
    UnterminatedQuote { path: PathBuf, line: usize },

    #[error("{path}:{line}: line ends with a dangling escape")]
    TrailingEscape { path: PathBuf, line: usize },

    #[error("{path}:{line}: malformed MACRO definition (expected `MACRO name = token ...`)")]
    MalformedMacro { path: PathBuf, line: usize },

    #[error("{path}:{line}: invalid macro name '{name}'")]
    InvalidMacroName {
        path: PathBuf,
        line: usize,
        name: String,
    },

    #[error("{path}:{line}: LONG MACRO '{name}' is missing its END MACRO")]
    UnterminatedLongMacro {
        path: PathBuf,
        line: usize,
        name: String,
    },

    #[error("call to undefined macro '{name}'")]
    UndefinedMacro { name: String },
}

enum TokenError {
    UnterminatedQuote,
    TrailingEscape,
}

/// Splits one line into tokens.
///
/// Quotes delimit tokens and preserve internal whitespace; a backslash masks
/// the delimiter meaning of the next character. Escape sequences are kept
/// verbatim in the token text. `#` outside quotes starts a comment.
fn tokenize(line: &str) -> Result<Vec<String>, TokenError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut in_quote = false;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                let Some(next) = chars.next() else {
                    return Err(TokenError::TrailingEscape);
                };
                current.push('\\');
                current.push(next);
                in_token = true;
            }
            '"' => {
                in_quote = !in_quote;
                in_token = true;
            }
            '#' if !in_quote => break,
            c if c.is_whitespace() && !in_quote => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if in_quote {
        return Err(TokenError::UnterminatedQuote);
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// The macro name called by `token`, if it has the `name()` form.
fn macro_call_name(token: &str) -> Option<&str> {
    MACRO_CALL
        .captures(token)
        .map(|captures| captures.get(1).unwrap().as_str())
}

struct WorkLine {
    tokens: Vec<String>,
    pending: bool,
}

/// Parses one command file and feeds the expanded lines to a sink.
///
/// A parser instance holds the state of one top-level parse (macro tables
/// and the seen-includes set); create a fresh one per file.
pub struct CommandFileParser {
    macros: HashMap<String, Vec<String>>,
    long_macros: HashMap<String, Vec<Vec<String>>>,
    lines: Vec<Vec<String>>,
    included_files: HashSet<PathBuf>,
}

impl CommandFileParser {
    pub fn new() -> Self {
        Self {
            macros: HashMap::new(),
            long_macros: HashMap::new(),
            lines: Vec::new(),
            included_files: HashSet::new(),
        }
    }

    /// Parses `path` and emits every expanded command line to `sink`.
    pub fn parse_file(
        &mut self,
        path: &Path,
        sink: &mut dyn CommandSink,
    ) -> Result<(), ConfigError> {
        self.parse_file_with_args(path, sink, &[])
    }

    /// Like [`parse_file`](Self::parse_file), appending `extra_args` to every
    /// emitted line.
    pub fn parse_file_with_args(
        &mut self,
        path: &Path,
        sink: &mut dyn CommandSink,
        extra_args: &[String],
    ) -> Result<(), ConfigError> {
        self.scan_file(path)?;
        let lines = std::mem::take(&mut self.lines);
        for mut argv in self.expand_macros(lines)? {
            argv.extend(extra_args.iter().cloned());
            sink.add_command(argv);
        }
        Ok(())
    }

    /// Reads one file, collecting macro definitions and command lines and
    /// recursing into includes. Each resolved path is scanned at most once
    /// per top-level parse.
    fn scan_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        if !self.included_files.insert(path.to_path_buf()) {
            debug!("skipping {}, already included in this parse", path.display());
            return Ok(());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut lines = contents.lines().enumerate();
        while let Some((index, raw)) = lines.next() {
            let line_no = index + 1;
            let tokens = tokenize(raw).map_err(|e| token_error(e, path, line_no))?;
            if tokens.is_empty() {
                continue;
            }

            if tokens[0] == "MACRO" {
                if tokens.len() < 4 || tokens[2] != "=" {
                    return Err(ConfigError::MalformedMacro {
                        path: path.to_path_buf(),
                        line: line_no,
                    });
                }
                let name = tokens[1].clone();
                if !MACRO_NAME.is_match(&name) {
                    return Err(ConfigError::InvalidMacroName {
                        path: path.to_path_buf(),
                        line: line_no,
                        name,
                    });
                }
                if self.macros.insert(name.clone(), tokens[3..].to_vec()).is_some() {
                    warn!("redefining macro '{name}'");
                }
                continue;
            }

            if tokens.len() == 3 && tokens[0] == "LONG" && tokens[1] == "MACRO" {
                let name = tokens[2].clone();
                if !MACRO_NAME.is_match(&name) {
                    return Err(ConfigError::InvalidMacroName {
                        path: path.to_path_buf(),
                        line: line_no,
                        name,
                    });
                }
                let mut body = Vec::new();
                let mut terminated = false;
                for (body_index, body_raw) in lines.by_ref() {
                    let body_tokens =
                        tokenize(body_raw).map_err(|e| token_error(e, path, body_index + 1))?;
                    if body_tokens.is_empty() {
                        continue;
                    }
                    if body_tokens.len() == 2
                        && body_tokens[0] == "END"
                        && body_tokens[1] == "MACRO"
                    {
                        terminated = true;
                        break;
                    }
                    body.push(body_tokens);
                }
                if !terminated {
                    return Err(ConfigError::UnterminatedLongMacro {
                        path: path.to_path_buf(),
                        line: line_no,
                        name,
                    });
                }
                if self.long_macros.insert(name.clone(), body).is_some() {
                    warn!("redefining long macro '{name}'");
                }
                continue;
            }

            if tokens.len() == 2 && tokens[0] == "INCLUDE" {
                let resolved = resolve_include(path, &tokens[1]);
                self.scan_file(&resolved)?;
                continue;
            }

            self.lines.push(tokens);
        }
        Ok(())
    }

    /// Expands macro calls to a fixpoint, left to right, innermost first.
    fn expand_macros(&self, lines: Vec<Vec<String>>) -> Result<Vec<Vec<String>>, ConfigError> {
        let mut work: Vec<WorkLine> = lines
            .into_iter()
            .map(|tokens| WorkLine {
                tokens,
                pending: true,
            })
            .collect();

        while work.iter().any(|line| line.pending) {
            let mut index = 0;
            while index < work.len() {
                if !work[index].pending {
                    index += 1;
                    continue;
                }
                let saw_short = self.expand_short_macros(&mut work[index].tokens);
                match self.expand_long_macro(&work[index].tokens, !saw_short)? {
                    Some(expansion) => {
                        // Replace the line in place; the expansion lines are
                        // rescanned starting from this position.
                        let replacement = expansion.into_iter().map(|tokens| WorkLine {
                            tokens,
                            pending: true,
                        });
                        work.splice(index..=index, replacement);
                    }
                    None => {
                        work[index].pending = saw_short;
                        index += 1;
                    }
                }
            }
        }

        Ok(work.into_iter().map(|line| line.tokens).collect())
    }

    /// Splices every known short-macro call in place. Returns whether any
    /// call was expanded.
    fn expand_short_macros(&self, tokens: &mut Vec<String>) -> bool {
        let mut saw_macro = false;
        let mut index = 0;
        while index < tokens.len() {
            let expansion =
                macro_call_name(&tokens[index]).and_then(|name| self.macros.get(name));
            match expansion {
                Some(expansion) => {
                    saw_macro = true;
                    let expansion = expansion.clone();
                    tokens.splice(index..=index, expansion);
                    // Leave the index in place so tokens pulled in by the
                    // expansion are seen this pass.
                }
                None => index += 1,
            }
        }
        saw_macro
    }

    /// Expands the first long-macro call in the line, wrapping each body
    /// line in the call site's prefix and suffix. One call per pass.
    ///
    /// With `check_missing` set (no short macro made progress this pass),
    /// a call token that names no macro at all is a configuration error.
    fn expand_long_macro(
        &self,
        tokens: &[String],
        check_missing: bool,
    ) -> Result<Option<Vec<Vec<String>>>, ConfigError> {
        for (index, token) in tokens.iter().enumerate() {
            let Some(name) = macro_call_name(token) else {
                continue;
            };
            match self.long_macros.get(name) {
                Some(body) => {
                    let prefix = &tokens[..index];
                    let suffix = &tokens[index + 1..];
                    let expansion = body
                        .iter()
                        .map(|body_line| {
                            let mut line =
                                Vec::with_capacity(prefix.len() + body_line.len() + suffix.len());
                            line.extend_from_slice(prefix);
                            line.extend_from_slice(body_line);
                            line.extend_from_slice(suffix);
                            line
                        })
                        .collect();
                    return Ok(Some(expansion));
                }
                None => {
                    if check_missing {
                        return Err(ConfigError::UndefinedMacro {
                            name: name.to_owned(),
                        });
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Default for CommandFileParser {
    fn default() -> Self {
        Self::new()
    }
}

fn token_error(error: TokenError, path: &Path, line: usize) -> ConfigError {
    match error {
        TokenError::UnterminatedQuote => ConfigError::UnterminatedQuote {
            path: path.to_path_buf(),
            line,
        },
        TokenError::TrailingEscape => ConfigError::TrailingEscape {
            path: path.to_path_buf(),
            line,
        },
    }
}

/// Resolves an `INCLUDE` target: absolute paths stand alone, relative paths
/// resolve against the including file's parent directory, and a file with no
/// parent resolves against the working directory.
fn resolve_include(including: &Path, target: &str) -> PathBuf {
    let target_path = Path::new(target);
    if target_path.is_absolute() {
        return target_path.to_path_buf();
    }
    match including.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(target_path),
        _ => target_path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::CollectingSink;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Writes `contents` as the top-level command file and parses it.
    fn parse(contents: &str) -> Result<Vec<Vec<String>>, ConfigError> {
        parse_with_args(contents, &[])
    }

    fn parse_with_args(
        contents: &str,
        extra_args: &[String],
    ) -> Result<Vec<Vec<String>>, ConfigError> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commands.txt");
        std::fs::write(&path, contents).unwrap();
        let mut sink = CollectingSink::default();
        CommandFileParser::new().parse_file_with_args(&path, &mut sink, extra_args)?;
        Ok(sink.commands)
    }

    fn argv(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn single_config_with_comment_and_blank_line() {
        let commands = parse("  #Comment followed by blank line\n \n--foo  config").unwrap();
        assert_eq!(commands, vec![argv(&["--foo", "config"])]);
    }

    #[test]
    fn quoted_tokens_preserve_whitespace_and_escapes() {
        let commands =
            parse(r#"--foo "this is a config" --bar "escap\\ed \" quotation""#).unwrap();
        assert_eq!(
            commands,
            vec![argv(&[
                "--foo",
                "this is a config",
                "--bar",
                r#"escap\\ed \" quotation"#
            ])]
        );
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        let result = parse("--foo \"this is truncated");
        assert!(matches!(result, Err(ConfigError::UnterminatedQuote { .. })));
    }

    #[test]
    fn trailing_escape_is_an_error() {
        let result = parse("--foo escape\\");
        assert!(matches!(result, Err(ConfigError::TrailingEscape { .. })));
    }

    #[test]
    fn extra_args_are_appended_to_every_line() {
        let commands = parse_with_args(
            "--foo config\n--foo config2\n",
            &argv(&["--arg", "cowabunga"]),
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![
                argv(&["--foo", "config", "--arg", "cowabunga"]),
                argv(&["--foo", "config2", "--arg", "cowabunga"]),
            ]
        );
    }

    #[test]
    fn simple_macro_expands() {
        let commands = parse("MACRO TeSt = verify\nTeSt()").unwrap();
        assert_eq!(commands, vec![argv(&["verify"])]);
    }

    #[test]
    fn redefined_macro_uses_the_latest_value() {
        let commands = parse("MACRO test = value 1\nMACRO test = value 2\ntest()").unwrap();
        assert_eq!(commands, vec![argv(&["value", "2"])]);
    }

    #[test]
    fn macro_bodies_may_contain_quoted_tokens() {
        let commands = parse("MACRO test = \"verify varify vorify\"\ntest()").unwrap();
        assert_eq!(commands, vec![argv(&["verify varify vorify"])]);
    }

    #[test]
    fn macro_names_allow_underscores_and_hyphens() {
        let commands = parse("MACRO under_score = verify\nunder_score()").unwrap();
        assert_eq!(commands, vec![argv(&["verify"])]);

        let commands = parse("MACRO hyphen-nated = verify\nhyphen-nated()").unwrap();
        assert_eq!(commands, vec![argv(&["verify"])]);
    }

    #[test]
    fn undefined_macro_call_is_an_error() {
        let result = parse("test()");
        assert!(matches!(
            result,
            Err(ConfigError::UndefinedMacro { name }) if name == "test"
        ));
    }

    #[test]
    fn empty_macro_definition_is_an_error() {
        let result = parse("MACRO test = \ntest()");
        assert!(matches!(result, Err(ConfigError::MalformedMacro { .. })));
    }

    #[test]
    fn simple_long_macro_expands() {
        let commands = parse("LONG MACRO test\nverify\nEND MACRO\ntest()").unwrap();
        assert_eq!(commands, vec![argv(&["verify"])]);
    }

    #[test]
    fn long_macro_emits_one_line_per_body_line() {
        let commands = parse(
            "LONG MACRO test\none two three\na b c\ndo re mi\nEND MACRO\ntest()",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![
                argv(&["one", "two", "three"]),
                argv(&["a", "b", "c"]),
                argv(&["do", "re", "mi"]),
            ]
        );
    }

    #[test]
    fn long_macro_bodies_skip_comments_and_blank_lines() {
        let commands = parse(
            "LONG MACRO test\n\none two three\n#a b c\ndo re mi\nEND MACRO\ntest()",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![argv(&["one", "two", "three"]), argv(&["do", "re", "mi"])]
        );
    }

    #[test]
    fn long_macro_without_end_is_an_error() {
        let result = parse("LONG MACRO test\nverify\ntest()");
        assert!(matches!(
            result,
            Err(ConfigError::UnterminatedLongMacro { name, .. }) if name == "test"
        ));
    }

    #[test]
    fn short_macro_expansion_after_the_call_converges() {
        // A short macro pulling in another call later in the line must leave
        // the line marked pending until the nested call resolves.
        let commands =
            parse("MACRO alpha = one beta()\nMACRO beta = two\nalpha()\n").unwrap();
        assert_eq!(commands, vec![argv(&["one", "two"])]);
    }

    #[test]
    fn short_macro_expansion_before_the_call_converges() {
        let commands =
            parse("MACRO alpha = beta() two\nMACRO beta = one\nalpha()\n").unwrap();
        assert_eq!(commands, vec![argv(&["one", "two"])]);
    }

    #[test]
    fn nested_long_macros_expand_fully() {
        // Long macro expansion changes the number of work lines mid-flight;
        // a partially expanded line must stay pending until it is resolved.
        let commands = parse(
            "MACRO hbar = quux\n\
             LONG MACRO bar\n\
             hbar() z\n\
             END MACRO\n\
             LONG MACRO foo\n\
             bar() x\n\
             END MACRO\n\
             LONG MACRO test\n\
             one foo()\n\
             END MACRO\n\
             test()\n\
             hbar()\n",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![argv(&["one", "quux", "z", "x"]), argv(&["quux"])]
        );
    }

    #[test]
    fn short_macro_inside_long_macro_body() {
        let commands = parse(
            "MACRO hbar = quux\n\
             LONG MACRO bar\n\
             hbar() z\n\
             END MACRO\n\
             LONG MACRO test\n\
             one bar() x\n\
             END MACRO\n\
             test()\n\
             hbar()\n",
        )
        .unwrap();
        assert_eq!(
            commands,
            vec![argv(&["one", "quux", "z", "x"]), argv(&["quux"])]
        );
    }

    #[test]
    fn include_inlines_the_referenced_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("orig.txt"), "INCLUDE sub.txt\n").unwrap();
        std::fs::write(dir.path().join("sub.txt"), "--foo bar\n").unwrap();

        let mut sink = CollectingSink::default();
        CommandFileParser::new()
            .parse_file(&dir.path().join("orig.txt"), &mut sink)
            .unwrap();
        assert_eq!(sink.commands, vec![argv(&["--foo", "bar"])]);
    }

    #[test]
    fn include_resolves_relative_to_the_including_file() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("orig.txt"), "INCLUDE sub.txt\n").unwrap();
        std::fs::write(nested.join("sub.txt"), "--foo bar\n").unwrap();

        let mut sink = CollectingSink::default();
        CommandFileParser::new()
            .parse_file(&nested.join("orig.txt"), &mut sink)
            .unwrap();
        assert_eq!(sink.commands, vec![argv(&["--foo", "bar"])]);
    }

    #[test]
    fn include_of_an_absolute_path_stands_alone() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a");
        std::fs::create_dir(&nested).unwrap();
        let absolute = dir.path().join("abs.txt");
        std::fs::write(&absolute, "--baz quux\n").unwrap();
        std::fs::write(
            nested.join("orig.txt"),
            format!("INCLUDE {}\n", absolute.display()),
        )
        .unwrap();

        let mut sink = CollectingSink::default();
        CommandFileParser::new()
            .parse_file(&nested.join("orig.txt"), &mut sink)
            .unwrap();
        assert_eq!(sink.commands, vec![argv(&["--baz", "quux"])]);
    }

    #[test]
    fn two_distinct_includes_both_contribute() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("orig.txt"),
            "INCLUDE somefile.txt\nINCLUDE otherfile.txt\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("somefile.txt"), "--foo bar\n").unwrap();
        std::fs::write(dir.path().join("otherfile.txt"), "--baz quux\n").unwrap();

        let mut sink = CollectingSink::default();
        CommandFileParser::new()
            .parse_file(&dir.path().join("orig.txt"), &mut sink)
            .unwrap();
        assert_eq!(
            sink.commands,
            vec![argv(&["--foo", "bar"]), argv(&["--baz", "quux"])]
        );
    }

    #[test]
    fn repeated_include_is_silently_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("orig.txt"),
            "INCLUDE somefile.txt\nINCLUDE somefile.txt\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("somefile.txt"), "--foo bar\n").unwrap();

        let mut sink = CollectingSink::default();
        CommandFileParser::new()
            .parse_file(&dir.path().join("orig.txt"), &mut sink)
            .unwrap();
        assert_eq!(sink.commands, vec![argv(&["--foo", "bar"])]);
    }

    #[test]
    fn missing_include_target_is_an_io_error() {
        let result = parse("INCLUDE nowhere.txt\n");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn parsing_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commands.txt");
        std::fs::write(&path, "MACRO m = a b\nm() c\n--flag \"x y\"\n").unwrap();

        let mut first = CollectingSink::default();
        CommandFileParser::new().parse_file(&path, &mut first).unwrap();
        let mut second = CollectingSink::default();
        CommandFileParser::new().parse_file(&path, &mut second).unwrap();

        assert_eq!(first.commands, second.commands);
        assert_eq!(
            first.commands,
            vec![argv(&["a", "b", "c"]), argv(&["--flag", "x y"])]
        );
    }

    #[test]
    fn resolve_include_handles_all_three_cases() {
        assert_eq!(
            resolve_include(Path::new("a/orig.txt"), "sub.txt"),
            PathBuf::from("a/sub.txt")
        );
        assert_eq!(
            resolve_include(Path::new("a/orig.txt"), "/usr/share/sub.txt"),
            PathBuf::from("/usr/share/sub.txt")
        );
        assert_eq!(
            resolve_include(Path::new("orig.txt"), "sub.txt"),
            PathBuf::from("sub.txt")
        );
    }
}
