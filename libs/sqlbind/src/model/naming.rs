/// Convert a `CamelCase` name to `snake_case`.
///
/// An underscore goes before an uppercase letter that follows a lowercase
/// letter or digit, or that starts a new word (is followed by a lowercase
/// letter and is not the first character). Acronyms stay together.
#[must_use]
pub fn camel_to_snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let after_lower_or_digit =
                prev.is_some_and(|p| p.is_ascii_lowercase() || p.is_ascii_digit());
            let starts_word = prev.is_some() && chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if after_lower_or_digit || starts_word {
                out.push('_');
            }
        }
        out.push(c.to_ascii_lowercase());
    }

    out.trim_start_matches('_').to_owned()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::camel_to_snake_case;

    #[test]
    fn test_camel_to_snake_case() {
        let cases = [
            ("CamelCase", "camel_case"),
            ("HTTPResponseCodeXYZ", "http_response_code_xyz"),
            ("UserST4", "user_st4"),
            ("get2HTTPResponse123Code", "get2_http_response123_code"),
            ("User", "user"),
            ("userGroup", "user_group"),
            ("ABC", "abc"),
            ("_Private", "private"),
        ];
        for (input, expected) in cases {
            assert_eq!(camel_to_snake_case(input), expected, "input: {input}");
        }
    }

    #[test]
    fn test_snake_case_input_is_unchanged() {
        assert_eq!(camel_to_snake_case("snake_case"), "snake_case");
        let once = camel_to_snake_case("SomeHTTPThing");
        assert_eq!(camel_to_snake_case(&once), once);
    }
}
