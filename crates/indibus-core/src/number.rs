//! Number parsing and formatting.
//!
//! Number elements travel as text. Besides plain decimals the protocol
//! accepts sexagesimal angles (`D:M:S`, `D:M`, also separated by `;` or
//! spaces) and describes display with printf-style formats, including the
//! sexagesimal `%<w>.<f>m` conversion.

/// Parses a number element value.
///
/// Accepts a plain decimal (`-12.5`, `1e3`) or a sexagesimal angle
/// (`-12:30:00`, `12:30`). Returns `None` for anything else, including
/// non-finite values.
pub fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let is_sexagesimal = text.contains([':', ';']) || text.contains(char::is_whitespace);
    let value = if is_sexagesimal {
        parse_sexagesimal(text)?
    } else {
        text.parse::<f64>().ok()?
    };

    value.is_finite().then_some(value)
}

fn parse_sexagesimal(text: &str) -> Option<f64> {
    let parts: Vec<&str> = text
        .split(|c: char| c == ':' || c == ';' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }

    let negative = parts[0].starts_with('-');
    let degrees: f64 = parts[0].parse().ok()?;
    let mut value = degrees.abs();
    let mut divisor = 1.0;
    for part in &parts[1..] {
        let component: f64 = part.parse().ok()?;
        if component < 0.0 {
            return None;
        }
        divisor *= 60.0;
        value += component / divisor;
    }

    Some(if negative { -value } else { value })
}

/// Formats a value according to a printf-style number format.
///
/// Supported conversions are `f`, `e`, `g`, `d`/`i` and the sexagesimal
/// `m`. Unknown formats fall back to Rust's shortest representation.
pub fn format_number(value: f64, format: &str) -> String {
    match NumberSpec::parse(format) {
        Some(spec) => spec.render(value),
        None => value.to_string(),
    }
}

/// Largest width or precision a format may request.
const MAX_FORMAT_COUNT: usize = 64;

/// Reads a run of decimal digits; `None` once it exceeds [`MAX_FORMAT_COUNT`].
fn take_count(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> Option<usize> {
    let mut count = 0usize;
    while let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
        count = count.checked_mul(10)?.checked_add(digit as usize)?;
        if count > MAX_FORMAT_COUNT {
            return None;
        }
        chars.next();
    }
    Some(count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NumberSpec {
    left_align: bool,
    zero_pad: bool,
    width: usize,
    precision: Option<usize>,
    conversion: char,
}

impl NumberSpec {
    fn parse(format: &str) -> Option<Self> {
        let body = format.trim().strip_prefix('%')?;
        let mut chars = body.chars().peekable();

        let mut left_align = false;
        let mut zero_pad = false;
        while let Some(&c) = chars.peek() {
            match c {
                '-' => left_align = true,
                '0' => zero_pad = true,
                '+' | ' ' | '#' => {}
                _ => break,
            }
            chars.next();
        }

        let width = take_count(&mut chars)?;

        let mut precision = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            precision = Some(take_count(&mut chars)?);
        }

        // Length modifiers carry no meaning for f64 output.
        while chars.peek() == Some(&'l') || chars.peek() == Some(&'h') {
            chars.next();
        }

        let conversion = chars.next()?;
        if !matches!(conversion, 'f' | 'e' | 'g' | 'd' | 'i' | 'm') || chars.next().is_some() {
            return None;
        }

        Some(Self {
            left_align,
            zero_pad,
            width,
            precision,
            conversion,
        })
    }

    fn render(&self, value: f64) -> String {
        let body = match self.conversion {
            'f' => format!("{:.*}", self.precision.unwrap_or(6), value),
            'e' => format_exponent(value, self.precision.unwrap_or(6)),
            'g' => format_general(value, self.precision.unwrap_or(6)),
            'd' | 'i' => format!("{}", value.round() as i64),
            'm' => return format_sexagesimal(value, self.width, self.precision.unwrap_or(6)),
            _ => value.to_string(),
        };
        self.pad(body)
    }

    fn pad(&self, body: String) -> String {
        let len = body.chars().count();
        if len >= self.width {
            return body;
        }
        let fill = self.width - len;
        if self.left_align {
            format!("{body}{}", " ".repeat(fill))
        } else if self.zero_pad {
            match body.strip_prefix('-') {
                Some(digits) => format!("-{}{digits}", "0".repeat(fill)),
                None => format!("{}{body}", "0".repeat(fill)),
            }
        } else {
            format!("{}{body}", " ".repeat(fill))
        }
    }
}

/// C-style `%e`: mantissa, sign and at least two exponent digits.
fn format_exponent(value: f64, precision: usize) -> String {
    let rust = format!("{:.*e}", precision, value);
    match rust.split_once('e') {
        Some((mantissa, exponent)) => {
            let exp: i32 = exponent.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.abs())
        }
        None => rust,
    }
}

/// C-style `%g`: the shorter of `%e`/`%f` with trailing zeros removed.
fn format_general(value: f64, precision: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    let precision = precision.max(1);
    let exponent = value.abs().log10().floor() as i32;

    if exponent < -4 || exponent >= precision as i32 {
        let formatted = format_exponent(value, precision - 1);
        match formatted.split_once('e') {
            Some((mantissa, exp)) => format!("{}e{exp}", strip_trailing_zeros(mantissa)),
            None => formatted,
        }
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        strip_trailing_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn strip_trailing_zeros(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Renders `value` as `D:MM[:SS[.s]]`, right-aligned to `width`.
///
/// `fraction` selects the resolution the same way the protocol's `%w.fm`
/// format does: 3 for minutes, 5 for tenths of minutes, 6 for seconds,
/// 8 for tenths and 9 for hundredths of seconds.
pub fn format_sexagesimal(value: f64, width: usize, fraction: usize) -> String {
    let base: u64 = match fraction {
        9 => 360_000,
        8 => 36_000,
        6 => 3_600,
        5 => 600,
        _ => 60,
    };

    let negative = value < 0.0;
    let scaled = (value.abs() * base as f64 + 0.5) as u64;
    let whole = scaled / base;
    let rest = scaled % base;

    let sign = if negative { "-" } else { "" };
    let head_width = width.saturating_sub(fraction);
    let head = format!("{sign}{whole}");
    let head = format!("{head:>head_width$}");

    let tail = match base {
        60 => format!(":{rest:02}"),
        600 => format!(":{:02}.{}", rest / 10, rest % 10),
        3_600 => format!(":{:02}:{:02}", rest / 60, rest % 60),
        36_000 => format!(":{:02}:{:02}.{}", rest / 600, (rest % 600) / 10, rest % 10),
        _ => format!(
            ":{:02}:{:02}.{:02}",
            rest / 6_000,
            (rest % 6_000) / 100,
            rest % 100
        ),
    };

    format!("{head}{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_decimals() {
        assert_eq!(parse_number("42"), Some(42.0));
        assert_eq!(parse_number(" -2.5 "), Some(-2.5));
        assert_eq!(parse_number("1.5e2"), Some(150.0));
    }

    #[test]
    fn parses_sexagesimal_angles() {
        assert_eq!(parse_number("12:30:00"), Some(12.5));
        assert_eq!(parse_number("10:15"), Some(10.25));
        assert_eq!(parse_number("-0:30"), Some(-0.5));
        assert_eq!(parse_number("1;30"), Some(1.5));
        assert_eq!(parse_number("1 45 00"), Some(1.75));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_number(""), None);
        assert_eq!(parse_number("abc"), None);
        assert_eq!(parse_number("12:xx"), None);
        assert_eq!(parse_number("1:2:3:4"), None);
        assert_eq!(parse_number("1:-30"), None);
        assert_eq!(parse_number("NaN"), None);
        assert_eq!(parse_number("inf"), None);
    }

    #[test]
    fn formats_fixed_and_integer() {
        assert_eq!(format_number(3.14159, "%.2f"), "3.14");
        assert_eq!(format_number(3.14159, "%8.3f"), "   3.142");
        assert_eq!(format_number(-3.5, "%06.1f"), "-003.5");
        assert_eq!(format_number(2.6, "%d"), "3");
        assert_eq!(format_number(7.0, "%-4d"), "7   ");
    }

    #[test]
    fn oversized_counts_fall_back_to_plain_output() {
        assert_eq!(format_number(1.5, "%99999999999999999999999f"), "1.5");
        assert_eq!(format_number(1.5, "%999999999f"), "1.5");
        assert_eq!(format_number(1.5, "%.99999999999999999999m"), "1.5");
        assert_eq!(format_number(1.5, "%65f"), "1.5");
        assert_eq!(format_number(1.5, "%64.1f").len(), 64);
    }

    #[test]
    fn formats_exponent_and_general() {
        assert_eq!(format_number(1500.0, "%.3e"), "1.500e+03");
        assert_eq!(format_number(0.0001, "%g"), "0.0001");
        assert_eq!(format_number(1234567.0, "%g"), "1.23457e+06");
        assert_eq!(format_number(2.5, "%g"), "2.5");
    }

    #[test]
    fn formats_sexagesimal() {
        assert_eq!(format_number(12.5, "%10.6m"), "  12:30:00");
        assert_eq!(format_number(-0.5, "%9.6m"), " -0:30:00");
        assert_eq!(format_number(1.25, "%5.3m"), " 1:15");
        assert_eq!(format_sexagesimal(1.2525, 0, 9), "1:15:09.00");
    }

    #[test]
    fn unknown_format_falls_back() {
        assert_eq!(format_number(1.5, "%s"), "1.5");
        assert_eq!(format_number(1.5, "plain"), "1.5");
    }
}
