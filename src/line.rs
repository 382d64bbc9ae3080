//! Line codec
//!
//! Tokenizes and reassembles protocol lines. Shared verbatim by the
//! client-facing protocol and the inter-process protocol.
//!
//! Format: an optional `:prefix` first token (ignored on parse), tokens
//! separated by runs of spaces, and an optional trailing token introduced
//! by `:` that swallows the rest of the line verbatim, spaces included.

/// Maximum wire line length, CRLF included
pub const MAX_LINE: usize = 512;

/// Parse one line into its argument vector.
///
/// Returns `None` for empty or whitespace-only lines (including lines
/// carrying nothing but a prefix). A bare trailing `:` yields an empty
/// final argument.
pub fn parse(line: &str) -> Option<Vec<String>> {
    let mut rest = line.trim_end_matches(['\r', '\n']);

    if let Some(stripped) = rest.strip_prefix(':') {
        rest = match stripped.find(' ') {
            Some(i) => &stripped[i..],
            None => return None,
        };
    }
    rest = rest.trim_start_matches(' ');
    if rest.is_empty() {
        return None;
    }

    let mut argv = Vec::new();
    let mut s = rest;
    while !s.is_empty() {
        // Only non-initial tokens can be the trailing argument.
        if !argv.is_empty() {
            if let Some(trailing) = s.strip_prefix(':') {
                argv.push(trailing.to_string());
                return Some(argv);
            }
        }
        match s.split_once(' ') {
            Some((token, tail)) => {
                argv.push(token.to_string());
                s = tail.trim_start_matches(' ');
            }
            None => {
                argv.push(s.to_string());
                break;
            }
        }
    }
    Some(argv)
}

/// Rebuild a wire line from an argument vector, CRLF appended.
///
/// The final token gains a leading `:` when it is empty, contains a space,
/// or itself starts with `:`, the cases `parse` would otherwise not
/// round-trip.
pub fn build<S: AsRef<str>>(argv: &[S]) -> String {
    let mut out = String::new();
    let last = argv.len().saturating_sub(1);
    for (i, arg) in argv.iter().enumerate() {
        let arg = arg.as_ref();
        if i > 0 {
            out.push(' ');
        }
        if i == last && i > 0 && (arg.is_empty() || arg.contains(' ') || arg.starts_with(':')) {
            out.push(':');
        }
        out.push_str(arg);
    }
    out.push_str("\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parsed(line: &str) -> Vec<String> {
        parse(line).unwrap()
    }

    #[test]
    fn splits_command_and_arguments() {
        assert_eq!(
            parsed("PRIVMSG #gateway :foo bar"),
            vec!["PRIVMSG", "#gateway", "foo bar"]
        );
        assert_eq!(parsed("NICK bob\r\n"), vec!["NICK", "bob"]);
        assert_eq!(parsed("USER bob 0 * :Bob"), vec!["USER", "bob", "0", "*", "Bob"]);
    }

    #[test]
    fn strips_prefix_and_collapses_spaces() {
        assert_eq!(
            parsed(":server.example  PONG   server :hi there"),
            vec!["PONG", "server", "hi there"]
        );
    }

    #[test]
    fn empty_and_prefix_only_lines_are_nothing() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   "), None);
        assert_eq!(parse("\r\n"), None);
        assert_eq!(parse(":prefix"), None);
        assert_eq!(parse(":prefix   "), None);
    }

    #[test]
    fn trailing_colon_is_an_empty_argument() {
        assert_eq!(parsed("TOPIC #chan :"), vec!["TOPIC", "#chan", ""]);
    }

    #[test]
    fn build_quotes_the_final_token_when_needed() {
        assert_eq!(build(&["PING", "srv"]), "PING srv\r\n");
        assert_eq!(build(&["PRIVMSG", "bob", "hi there"]), "PRIVMSG bob :hi there\r\n");
        assert_eq!(build(&["TOPIC", "#chan", ""]), "TOPIC #chan :\r\n");
        assert_eq!(build(&["PRIVMSG", "bob", ":)"]), "PRIVMSG bob ::)\r\n");
    }

    #[test]
    fn build_parse_round_trip() {
        let cases: &[&[&str]] = &[
            &["PRIVMSG", "#gateway", "foo bar"],
            &["NICK", "bob"],
            &["USER", "bob", "0", "*", "Bob the Builder"],
            &["TOPIC", "#chan", ""],
            &["WALLOPS", "multi  space   message"],
            &["AUTHENTICATE", "+"],
        ];
        for argv in cases {
            let line = build(argv);
            let reparsed = parse(&line).unwrap();
            assert_eq!(&reparsed, argv, "round-trip failed for {line:?}");
        }
    }

    #[test]
    fn parse_build_is_protocol_equivalent() {
        // Equivalent, not byte-identical: token separators collapse.
        let line = "MODE  bob   +w";
        let rebuilt = build(&parsed(line));
        assert_eq!(parse(&rebuilt).unwrap(), parsed(line));
    }
}
