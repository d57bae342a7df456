use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref PUNCTUATION_TOKEN: Regex = Regex::new(r"^[.,:;!?]$").unwrap();
}

pub fn is_punctuation(token: &str) -> bool {
    PUNCTUATION_TOKEN.is_match(token)
}

/// Joins dragged tokens into a sentence. Punctuation tokens stick to the
/// previous word; everything else is separated by one space.
pub fn join_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    let mut sentence = String::new();
    for token in tokens {
        let token = token.as_ref().trim();
        if token.is_empty() {
            continue;
        }
        if !sentence.is_empty() && !is_punctuation(token) {
            sentence.push(' ');
        }
        sentence.push_str(token);
    }
    sentence
}

/// Comparison form: lowercase, single-spaced, trailing `!?.` removed.
pub fn normalize_sentence(sentence: &str) -> String {
    let collapsed = sentence
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(['!', '?', '.'])
        .trim_end()
        .to_string()
}

pub fn is_correct(user_sentence: &str, correct_sentence: &str) -> bool {
    normalize_sentence(user_sentence) == normalize_sentence(correct_sentence)
}

/// Joined answer text plus its verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub answer: String,
    pub is_correct: bool,
}

pub fn check_tokens<S: AsRef<str>>(tokens: &[S], correct_sentence: &str) -> Verdict {
    let answer = join_tokens(tokens);
    let is_correct = is_correct(&answer, correct_sentence);
    Verdict { answer, is_correct }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn punctuation_attaches_to_previous_token() {
        assert_eq!(join_tokens(&["I", "love", "cats", "."]), "I love cats.");
        assert_eq!(
            join_tokens(&["Yes", ",", "I", "do", "!"]),
            "Yes, I do!"
        );
        assert_eq!(join_tokens(&["Wait", ":", "what", "?"]), "Wait: what?");
    }

    #[test]
    fn leading_punctuation_has_no_space() {
        assert_eq!(join_tokens(&[".", "cats"]), ". cats");
    }

    #[test]
    fn only_single_character_marks_are_punctuation() {
        assert!(is_punctuation("."));
        assert!(is_punctuation(";"));
        assert!(!is_punctuation("..."));
        assert!(!is_punctuation("-"));
        assert!(!is_punctuation("a"));
    }

    #[test]
    fn comparison_ignores_case_whitespace_and_final_mark() {
        let verdict = check_tokens(&["I", "love", "cats", "."], "I love cats.");
        assert!(verdict.is_correct);
        assert_eq!(verdict.answer, "I love cats.");
        assert_eq!(normalize_sentence(&verdict.answer), "i love cats");

        assert!(is_correct("i LOVE   cats", "  I love cats!"));
        assert!(is_correct("I love cats", "I love cats?!"));
    }

    #[test]
    fn word_order_matters() {
        assert!(!check_tokens(&["cats", "love", "I", "."], "I love cats.").is_correct);
    }

    #[test]
    fn inner_punctuation_must_match() {
        assert!(!is_correct("Yes I do", "Yes, I do."));
        assert!(is_correct("Yes, I do", "Yes, I do."));
    }
}
