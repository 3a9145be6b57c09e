//! Identifier casing transformers.
//!
//! Pure functions converting host-side member names into the casings
//! scripts expect. Both are acronym-aware: a run of capitals is treated as
//! one word, so `HelloHTMLStuff` becomes `hello_html_stuff` and
//! `helloHTMLStuff` rather than `hello_h_t_m_l_stuff`.

/// Convert an exported host name to snake_case.
pub fn to_snake_case(input: &str) -> String {
    let runes: Vec<char> = input.chars().collect();
    let length = runes.len();

    let mut out = String::with_capacity(input.len() + 4);
    for i in 0..length {
        if i > 0
            && runes[i].is_uppercase()
            && ((i + 1 < length && runes[i + 1].is_lowercase()) || runes[i - 1].is_lowercase())
        {
            out.push('_');
        }
        out.extend(runes[i].to_lowercase());
    }

    out
}

/// Convert an exported host name to camelCase.
pub fn to_camel_case(input: &str) -> String {
    let runes: Vec<char> = input.chars().collect();
    let length = runes.len();

    let mut out = String::with_capacity(input.len());
    if length > 1 {
        if runes[0].is_uppercase() && runes[1].is_lowercase() {
            out.extend(runes[0].to_lowercase());
            out.extend(&runes[1..]);
        } else if runes[0].is_uppercase() && runes[1].is_uppercase() {
            // Leading acronym: lower-case it except for its final letter,
            // which starts the next word.
            let mut i = 0;
            while i < length && runes[i].is_uppercase() {
                if i + 1 < length && runes[i + 1].is_uppercase() {
                    out.extend(runes[i].to_lowercase());
                } else {
                    out.push(runes[i]);
                }
                i += 1;
            }
            if i < length {
                out.extend(&runes[i..]);
            }
        } else {
            out.extend(&runes);
        }
    } else if length == 1 {
        out.extend(runes[0].to_lowercase());
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn snake_simple_word() {
        assert_eq!(to_snake_case("Hello"), "hello");
    }

    #[test]
    fn snake_two_words() {
        assert_eq!(to_snake_case("OneTwo"), "one_two");
    }

    #[test]
    fn snake_acronym_run() {
        assert_eq!(to_snake_case("HelloHTMLStuff"), "hello_html_stuff");
    }

    #[test]
    fn snake_all_caps() {
        assert_eq!(to_snake_case("ABC"), "abc");
    }

    #[test]
    fn camel_simple_word() {
        assert_eq!(to_camel_case("Hello"), "hello");
    }

    #[test]
    fn camel_acronym_run() {
        assert_eq!(to_camel_case("HelloHTMLStuff"), "helloHTMLStuff");
    }

    #[test]
    fn camel_leading_acronym() {
        assert_eq!(to_camel_case("HTMLStuff"), "htmlStuff");
    }

    #[test]
    fn camel_single_letter() {
        assert_eq!(to_camel_case("X"), "x");
    }

    #[test]
    fn empty_input_stays_empty() {
        assert_eq!(to_snake_case(""), "");
        assert_eq!(to_camel_case(""), "");
    }

    proptest! {
        #[test]
        fn snake_output_has_no_uppercase(s in "[A-Za-z]{0,24}") {
            let out = to_snake_case(&s);
            prop_assert!(out.chars().all(|c| !c.is_uppercase()));
        }

        #[test]
        fn snake_is_idempotent(s in "[A-Za-z]{0,24}") {
            let once = to_snake_case(&s);
            let twice = to_snake_case(&once);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn camel_preserves_length(s in "[A-Za-z]{0,24}") {
            let out = to_camel_case(&s);
            prop_assert_eq!(out.chars().count(), s.chars().count());
        }
    }
}
