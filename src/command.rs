/// One classified input line. Arguments borrow from the line and are never
/// validated or case-folded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Helo(&'a str),
    MailFrom(&'a str),
    RcptTo(&'a str),
    Data,
    DataTerminator,
    StartTls,
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    /// Classifies an already trimmed line. First matching rule wins.
    pub fn parse(line: &'a str) -> Self {
        if has_prefix(line, "HELO") || has_prefix(line, "EHLO") {
            // Token plus one separator; anything shorter has no argument.
            Command::Helo(line.get(5..).unwrap_or(""))
        } else if has_prefix(line, "MAIL FROM:") {
            Command::MailFrom(&line["MAIL FROM:".len()..])
        } else if has_prefix(line, "RCPT TO:") {
            Command::RcptTo(&line["RCPT TO:".len()..])
        } else if has_prefix(line, "DATA") {
            Command::Data
        } else if line == "." {
            Command::DataTerminator
        } else if line.eq_ignore_ascii_case("STARTTLS") {
            Command::StartTls
        } else if line.eq_ignore_ascii_case("QUIT") {
            Command::Quit
        } else {
            Command::Unknown(line)
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Helo(_) => "HELO",
            Command::MailFrom(_) => "MAIL FROM",
            Command::RcptTo(_) => "RCPT TO",
            Command::Data => "DATA",
            Command::DataTerminator => "DATA END",
            Command::StartTls => "STARTTLS",
            Command::Quit => "QUIT",
            Command::Unknown(_) => "UNKNOWN",
        }
    }
}

fn has_prefix(line: &str, keyword: &str) -> bool {
    line.get(..keyword.len())
        .map_or(false, |head| head.eq_ignore_ascii_case(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_match_in_any_case() {
        for line in ["HELO a", "helo a", "HeLo a", "EHLO a", "ehlo a"] {
            assert_eq!(Command::parse(line), Command::Helo("a"), "{}", line);
        }
        for line in ["MAIL FROM:<x@y>", "mail from:<x@y>", "Mail From:<x@y>"] {
            assert_eq!(Command::parse(line), Command::MailFrom("<x@y>"));
        }
        for line in ["RCPT TO:<x@y>", "rcpt to:<x@y>", "RcPt To:<x@y>"] {
            assert_eq!(Command::parse(line), Command::RcptTo("<x@y>"));
        }
        for line in ["DATA", "data", "Data"] {
            assert_eq!(Command::parse(line), Command::Data);
        }
        for line in ["STARTTLS", "starttls", "StartTLS"] {
            assert_eq!(Command::parse(line), Command::StartTls);
        }
        for line in ["QUIT", "quit", "Quit"] {
            assert_eq!(Command::parse(line), Command::Quit);
        }
    }

    #[test]
    fn helo_argument_is_kept_verbatim() {
        assert_eq!(Command::parse("helo Example.COM"), Command::Helo("Example.COM"));
        assert_eq!(Command::parse("HELO  two spaces"), Command::Helo(" two spaces"));
    }

    #[test]
    fn short_helo_has_empty_argument() {
        assert_eq!(Command::parse("HELO"), Command::Helo(""));
        assert_eq!(Command::parse("HELO "), Command::Helo(""));
        assert_eq!(Command::parse("ehlo"), Command::Helo(""));
    }

    #[test]
    fn helo_separator_inside_multibyte_char_degrades_to_empty() {
        // 'é' spans bytes 4..6, so byte 5 is not a char boundary.
        assert_eq!(Command::parse("HELOé"), Command::Helo(""));
    }

    #[test]
    fn data_terminator_is_exact() {
        assert_eq!(Command::parse("."), Command::DataTerminator);
        assert_eq!(Command::parse(".."), Command::Unknown(".."));
    }

    #[test]
    fn unmatched_lines_are_unknown() {
        assert_eq!(Command::parse("FOOBAR"), Command::Unknown("FOOBAR"));
        assert_eq!(Command::parse(""), Command::Unknown(""));
        assert_eq!(Command::parse("MAIL <x@y>"), Command::Unknown("MAIL <x@y>"));
        assert_eq!(Command::parse("STARTTLS now"), Command::Unknown("STARTTLS now"));
        assert_eq!(Command::parse("QUITTING"), Command::Unknown("QUITTING"));
        assert_eq!(Command::parse("HEL"), Command::Unknown("HEL"));
    }

    #[test]
    fn data_is_a_prefix_match() {
        assert_eq!(Command::parse("DATA please"), Command::Data);
    }
}
