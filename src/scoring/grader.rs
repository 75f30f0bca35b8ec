//! Answer equivalence for math-style ground truths.

use regex::Regex;
use std::sync::LazyLock;

/// Decides whether a candidate answer matches the ground truth.
///
/// Implementations must be pure: the scorer calls them concurrently from
/// many tasks.
pub trait AnswerGrader: Send + Sync {
    fn is_equivalent(&self, candidate: &str, ground_truth: &str) -> bool;
}

static TEXT_WRAPPER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\\(?:text|textbf|mathrm|mbox)\{([^{}]*)\}").expect("static regex is valid")
});
static THOUSANDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d),(\d{3})\b").expect("static regex is valid"));
static FRACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-?)\\frac\{(-?\d+(?:\.\d+)?)\}\{(-?\d+(?:\.\d+)?)\}$")
        .expect("static regex is valid")
});
static SLASH_FRACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(-?\d+(?:\.\d+)?)/(-?\d+(?:\.\d+)?)$").expect("static regex is valid")
});

/// Grades the last `\boxed{...}` expression of a response.
///
/// Both sides are normalized (LaTeX spacing, `\left`/`\right`, `\dfrac`,
/// `\text{}`, degree and percent marks, thousands separators) and compared
/// as strings, then numerically. A response without a boxed answer never
/// matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxedAnswerGrader;

impl BoxedAnswerGrader {
    /// Content of the last complete `\boxed{...}` or `\fbox{...}` in `text`.
    ///
    /// Braces are balanced, so nested groups like `\boxed{\frac{1}{2}}`
    /// come back whole. The brace-less form `\boxed 70` is accepted too.
    /// A trailing marker without a usable group (a truncated response) is
    /// skipped in favor of an earlier complete one.
    pub fn extract_boxed(text: &str) -> Option<&str> {
        let mut markers: Vec<(usize, &str)> = ["\\boxed", "\\fbox"]
            .iter()
            .flat_map(|m| text.match_indices(*m))
            .collect();
        markers.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        markers
            .into_iter()
            .find_map(|(start, marker)| Self::group_after(&text[start + marker.len()..]))
    }

    /// The group that opens at the start of `rest`, if it is complete.
    fn group_after(rest: &str) -> Option<&str> {
        if let Some(body) = rest.strip_prefix('{') {
            let mut depth = 1usize;
            for (i, c) in body.char_indices() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(&body[..i]);
                        }
                    }
                    _ => {}
                }
            }
            // Unterminated group
            return None;
        }

        let body = rest.strip_prefix(' ')?;
        let end = body.find(['$', '\n']).unwrap_or(body.len());
        let answer = body[..end].trim();
        (!answer.is_empty()).then_some(answer)
    }

    /// Canonical text form of an answer.
    pub fn normalize(answer: &str) -> String {
        let mut s = answer.trim().trim_matches('$').trim().to_string();

        // Repeat until no wrapper is left so nested wrappers unwrap fully.
        while TEXT_WRAPPER_RE.is_match(&s) {
            s = TEXT_WRAPPER_RE.replace_all(&s, "$1").into_owned();
        }

        for (from, to) in [
            ("\\left", ""),
            ("\\right", ""),
            ("\\!", ""),
            ("\\,", ""),
            ("\\;", ""),
            ("\\:", ""),
            ("\\ ", ""),
            ("\\dfrac", "\\frac"),
            ("\\tfrac", "\\frac"),
            ("^{\\circ}", ""),
            ("^\\circ", ""),
            ("°", ""),
            ("\\%", ""),
            ("%", ""),
            ("\\$", ""),
        ] {
            s = s.replace(from, to);
        }

        s.retain(|c| !c.is_whitespace());

        while THOUSANDS_RE.is_match(&s) {
            s = THOUSANDS_RE.replace_all(&s, "$1$2").into_owned();
        }

        let s = s.trim_end_matches('.');

        // "x=5" → "5" when the left side is a bare variable
        match s.split_once('=') {
            Some((lhs, rhs)) if lhs.len() <= 2 && !rhs.contains('=') && !rhs.is_empty() => {
                rhs.to_string()
            }
            _ => s.to_string(),
        }
    }

    /// Numeric value of a normalized answer, if it is a plain number or a
    /// simple fraction.
    fn numeric_value(normalized: &str) -> Option<f64> {
        if let Ok(v) = normalized.parse::<f64>() {
            return v.is_finite().then_some(v);
        }

        let (sign, num, den) = if let Some(caps) = FRACTION_RE.captures(normalized) {
            (
                caps.get(1).map_or("", |m| m.as_str()),
                caps.get(2)?.as_str(),
                caps.get(3)?.as_str(),
            )
        } else {
            let caps = SLASH_FRACTION_RE.captures(normalized)?;
            ("", caps.get(1)?.as_str(), caps.get(2)?.as_str())
        };

        let num: f64 = num.parse().ok()?;
        let den: f64 = den.parse().ok()?;
        if den == 0.0 {
            return None;
        }
        let value = num / den;
        Some(if sign == "-" { -value } else { value })
    }
}

impl AnswerGrader for BoxedAnswerGrader {
    fn is_equivalent(&self, candidate: &str, ground_truth: &str) -> bool {
        let Some(candidate) = Self::extract_boxed(candidate) else {
            return false;
        };
        let truth = Self::extract_boxed(ground_truth).unwrap_or(ground_truth);

        let candidate = Self::normalize(candidate);
        let truth = Self::normalize(truth);
        if candidate.is_empty() || truth.is_empty() {
            return false;
        }
        if candidate == truth {
            return true;
        }

        match (Self::numeric_value(&candidate), Self::numeric_value(&truth)) {
            (Some(a), Some(b)) => (a - b).abs() <= 1e-6 * b.abs().max(1.0),
            _ => false,
        }
    }
}
