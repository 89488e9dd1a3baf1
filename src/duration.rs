use thiserror::Error;

const SECOND_MS: u64 = 1_000;
const MINUTE_MS: u64 = 60 * SECOND_MS;
const HOUR_MS: u64 = 60 * MINUTE_MS;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Unit {
    Hours,
    Minutes,
    Seconds,
}

impl Unit {
    fn from_char(ch: char) -> Option<Unit> {
        match ch {
            'h' => Some(Unit::Hours),
            'm' => Some(Unit::Minutes),
            's' => Some(Unit::Seconds),
            _ => None,
        }
    }

    fn millis(self) -> u64 {
        match self {
            Unit::Hours => HOUR_MS,
            Unit::Minutes => MINUTE_MS,
            Unit::Seconds => SECOND_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DurationError {
    #[error("no duration given")]
    Empty,
    #[error("unexpected character '{0}'")]
    UnexpectedChar(char),
    #[error("unit '{0}' has no number in front of it")]
    MissingDigits(char),
    #[error("number {0} has no unit (use h, m or s)")]
    MissingUnit(String),
    #[error("duration is too large")]
    Overflow,
}

/// One `<digits><unit>` group of a token.
#[derive(Debug, Clone, PartialEq)]
struct Group {
    amount: u64,
    unit: Unit,
}

fn tokenize(input: &str) -> Result<Vec<Group>, DurationError> {
    let mut groups = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        if Unit::from_char(ch).is_some() {
            return Err(DurationError::MissingDigits(ch));
        }
        if !ch.is_ascii_digit() {
            return Err(DurationError::UnexpectedChar(ch));
        }

        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                chars.next();
            } else {
                break;
            }
        }

        let unit = match chars.next() {
            Some(c) => Unit::from_char(c).ok_or(DurationError::UnexpectedChar(c))?,
            None => return Err(DurationError::MissingUnit(digits)),
        };
        let amount = digits.parse::<u64>().map_err(|_| DurationError::Overflow)?;
        groups.push(Group { amount, unit });
    }

    Ok(groups)
}

/// Parses tokens such as `1h30m`, `45s` or `30m1h` into milliseconds.
///
/// Groups may come in any order and repeat; their values are summed. A
/// well-formed token of zeros (`0h`) is `Ok(0)`, which callers can tell
/// apart from a malformed one.
pub fn parse_duration(token: &str) -> Result<u64, DurationError> {
    if token.is_empty() {
        return Err(DurationError::Empty);
    }

    tokenize(token)?.into_iter().try_fold(0u64, |total, group| {
        group
            .amount
            .checked_mul(group.unit.millis())
            .and_then(|ms| total.checked_add(ms))
            .ok_or(DurationError::Overflow)
    })
}
