//! Deterministic name derivation rules: struct field name →
//! column name, and entity type name → table name.

/// Convert a `PascalCase`/`camelCase` identifier to `snake_case`.
///
/// Two boundary rules apply, composed into a single left-to-right scan:
///
/// - a digit run starts a new segment (`Field1 → field_1`);
/// - a run of consecutive uppercase letters followed by a lowercase
///   letter splits at the *last* uppercase letter, so the lowercase
///   letter stays attached to the word it starts
///   (`HTTPClient → http_client`).
pub fn snake_case(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        let prev = if i > 0 { Some(chars[i - 1]) } else { None };
        let next = chars.get(i + 1).copied();

        if c.is_uppercase() {
            let boundary = match prev {
                None => false,
                Some(p) if p.is_lowercase() || p.is_numeric() => true,
                Some(p) if p.is_uppercase() => next.map(|n| n.is_lowercase()).unwrap_or(false),
                _ => false,
            };
            if boundary {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else if c.is_numeric() {
            let boundary = matches!(prev, Some(p) if p.is_alphabetic());
            if boundary {
                out.push('_');
            }
            out.push(c);
        } else {
            out.push(c);
        }
    }

    out
}

/// A deliberately simple English pluralizer covering the common
/// suffix rules, sufficient for table-name derivation. Entities with
/// irregular plurals should use an explicit table name override.
pub fn pluralize(snake: &str) -> String {
    if snake.ends_with('s')
        || snake.ends_with('x')
        || snake.ends_with('z')
        || snake.ends_with("ch")
        || snake.ends_with("sh")
    {
        format!("{snake}es")
    } else if let Some(stem) = snake.strip_suffix('y') {
        let before_y = stem.chars().last();
        match before_y {
            Some(c) if !is_vowel(c) => format!("{stem}ies"),
            _ => format!("{snake}s"),
        }
    } else {
        format!("{snake}s")
    }
}

fn is_vowel(c: char) -> bool {
    matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u')
}

/// `TypeName → snake_plural_table_name`, the default table-name rule.
pub fn default_table_name(type_name: &str) -> String {
    pluralize(&snake_case(type_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_handles_digit_boundaries() {
        assert_eq!(snake_case("Field1"), "field_1");
        assert_eq!(snake_case("Address2Line"), "address_2_line");
    }

    #[test]
    fn snake_case_handles_acronym_boundaries() {
        assert_eq!(snake_case("HTTPClient"), "http_client");
        assert_eq!(snake_case("UserID"), "user_id");
        assert_eq!(snake_case("ID"), "id");
    }

    #[test]
    fn snake_case_handles_plain_camel_case() {
        assert_eq!(snake_case("userAge"), "user_age");
        assert_eq!(snake_case("UserAge"), "user_age");
    }

    #[test]
    fn default_table_name_pluralizes_snake_case_type_name() {
        assert_eq!(default_table_name("TestModel"), "test_models");
    }

    #[test]
    fn pluralize_handles_common_suffixes() {
        assert_eq!(pluralize("box"), "boxes");
        assert_eq!(pluralize("category"), "categories");
        assert_eq!(pluralize("key"), "keys");
        assert_eq!(pluralize("bus"), "buses");
    }
}
