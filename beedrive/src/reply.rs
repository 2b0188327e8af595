//! Tokenizer for letter-prefixed reply fields.
//!
//! Firmware replies carry values as `<Letter>:<value>` or `<Letter><value>`
//! tokens separated by whitespace, for example `T:210.5 B:0.0` for
//! temperatures or `A12 B60000 C3400 D120` for print variables.

/// Fields extracted from one reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyFields<'a> {
    fields: Vec<(char, &'a str)>,
}

impl<'a> ReplyFields<'a> {
    /// Split `text` into letter/value pairs. Tokens that do not start with
    /// an ASCII letter followed by a value are skipped.
    pub fn parse(text: &'a str) -> Self {
        let fields = text
            .split_whitespace()
            .filter_map(|token| {
                let mut chars = token.chars();
                let letter = chars
                    .next()
                    .filter(char::is_ascii_alphabetic)?;
                let rest = chars.as_str();
                let value = rest
                    .strip_prefix(':')
                    .unwrap_or(rest)
                    .trim_end_matches([',', ';']);
                (!value.is_empty()).then(|| (letter.to_ascii_uppercase(), value))
            })
            .collect();
        Self { fields }
    }

    /// First field with `letter` whose value parses as a float.
    pub fn float(&self, letter: char) -> Option<f64> {
        self.values(letter)
            .find_map(|v| v.parse().ok())
    }

    /// First field with `letter` whose value parses as an integer.
    pub fn int(&self, letter: char) -> Option<i64> {
        self.values(letter)
            .find_map(|v| v.parse().ok())
    }

    fn values(&self, letter: char) -> impl Iterator<Item = &'a str> + '_ {
        let letter = letter.to_ascii_uppercase();
        self.fields
            .iter()
            .filter(move |(l, _)| *l == letter)
            .map(|(_, v)| *v)
    }
}

/// Progress counters reported by `M32`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PrintVariables {
    /// Estimated total print time in minutes.
    pub estimated_minutes: Option<u64>,
    /// Elapsed print time in minutes.
    pub elapsed_minutes: Option<u64>,
    /// Number of lines in the file being printed.
    pub total_lines: Option<u64>,
    /// Number of lines executed so far.
    pub executed_lines: Option<u64>,
}

impl PrintVariables {
    /// Decode an `M32` reply. Elapsed time arrives in milliseconds.
    pub fn from_reply(reply: &str) -> Self {
        let fields = ReplyFields::parse(reply);
        let unsigned = |letter| {
            fields
                .int(letter)
                .and_then(|v| u64::try_from(v).ok())
        };
        Self {
            estimated_minutes: unsigned('A'),
            elapsed_minutes: unsigned('B').map(|ms| ms / 60_000),
            total_lines: unsigned('C'),
            executed_lines: unsigned('D'),
        }
    }

    /// Share of lines executed, if the counters are known.
    pub fn percent_complete(&self) -> Option<f64> {
        match (self.executed_lines, self.total_lines) {
            (Some(done), Some(total)) if total > 0 => Some(done as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}
