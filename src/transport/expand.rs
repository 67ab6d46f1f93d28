use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
    #[error("unterminated quote in command")]
    UnterminatedQuote,

    #[error("unterminated ${{...}} expansion")]
    UnterminatedBrace,

    #[error("command substitution is not supported")]
    CommandSubstitution,

    #[error("empty variable name in expansion")]
    EmptyVarName,

    #[error("command is empty")]
    EmptyCommand,
}

/// Split a command string into argv fields, expanding `${VAR}`,
/// `${VAR:-default}` and `${VAR:+alt}` along the way.
///
/// Single quotes suppress expansion; double quotes allow it but suppress
/// field splitting. Unquoted expansion results are field-split on
/// whitespace, and a word that expands to nothing yields no field. No other
/// shell constructs are interpreted.
pub fn expand_fields<F>(command: &str, lookup: &F) -> Result<Vec<String>, ExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut fields: Vec<String> = Vec::new();
    let mut current = String::new();
    // Distinguishes an empty field produced by quotes ("" is a real field)
    // from no field at all.
    let mut in_field = false;

    let chars: Vec<char> = command.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => {
                if in_field {
                    fields.push(std::mem::take(&mut current));
                    in_field = false;
                }
                i += 1;
            }
            '\'' => {
                in_field = true;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '\'' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExpandError::UnterminatedQuote);
                }
                current.extend(&chars[start..i]);
                i += 1;
            }
            '"' => {
                in_field = true;
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(ExpandError::UnterminatedQuote);
                    }
                    match chars[i] {
                        '"' => {
                            i += 1;
                            break;
                        }
                        '$' => {
                            let (value, next) = expand_dollar(&chars, i, lookup)?;
                            current.push_str(&value);
                            i = next;
                        }
                        other => {
                            current.push(other);
                            i += 1;
                        }
                    }
                }
            }
            '$' => {
                let (value, next) = expand_dollar(&chars, i, lookup)?;
                // Unquoted expansion undergoes field splitting.
                let mut parts = value.split_whitespace();
                match parts.next() {
                    None => {
                        // All-whitespace expansion still terminates a field.
                        if !value.is_empty() && in_field {
                            fields.push(std::mem::take(&mut current));
                            in_field = false;
                        }
                    }
                    Some(first) => {
                        if value.starts_with(char::is_whitespace) && in_field {
                            fields.push(std::mem::take(&mut current));
                            in_field = false;
                        }
                        current.push_str(first);
                        in_field = true;
                        for part in parts {
                            fields.push(std::mem::take(&mut current));
                            current.push_str(part);
                        }
                        if value.ends_with(char::is_whitespace) {
                            fields.push(std::mem::take(&mut current));
                            in_field = false;
                        }
                    }
                }
                i = next;
            }
            other => {
                current.push(other);
                in_field = true;
                i += 1;
            }
        }
    }

    if in_field {
        fields.push(current);
    }

    if fields.is_empty() {
        return Err(ExpandError::EmptyCommand);
    }

    Ok(fields)
}

/// Expand one `$`-construct starting at `chars[start] == '$'`. Returns the
/// expanded text and the index just past the construct.
fn expand_dollar<F>(
    chars: &[char],
    start: usize,
    lookup: &F,
) -> Result<(String, usize), ExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut i = start + 1;
    if i >= chars.len() {
        // Trailing bare '$' stays literal.
        return Ok(("$".to_string(), i));
    }

    match chars[i] {
        '(' => Err(ExpandError::CommandSubstitution),
        '{' => {
            i += 1;
            let name_start = i;
            while i < chars.len() && is_var_char(chars[i]) {
                i += 1;
            }
            let name: String = chars[name_start..i].iter().collect();
            if name.is_empty() {
                return Err(ExpandError::EmptyVarName);
            }

            let value = lookup(&name);

            if i < chars.len() && chars[i] == '}' {
                // ${VAR}
                return Ok((value.unwrap_or_default(), i + 1));
            }

            // ${VAR:-word} or ${VAR:+word}
            if i + 1 < chars.len() && chars[i] == ':' && (chars[i + 1] == '-' || chars[i + 1] == '+')
            {
                let op = chars[i + 1];
                i += 2;
                let (word, next) = read_brace_word(chars, i)?;
                i = next;

                let set_and_nonempty = matches!(&value, Some(v) if !v.is_empty());
                let expanded = match op {
                    '-' => {
                        if set_and_nonempty {
                            value.unwrap_or_default()
                        } else {
                            expand_word(&word, lookup)?
                        }
                    }
                    '+' => {
                        if set_and_nonempty {
                            expand_word(&word, lookup)?
                        } else {
                            String::new()
                        }
                    }
                    _ => unreachable!(),
                };
                return Ok((expanded, i));
            }

            Err(ExpandError::UnterminatedBrace)
        }
        c if is_var_char(c) => {
            // Plain $VAR.
            let name_start = i;
            while i < chars.len() && is_var_char(chars[i]) {
                i += 1;
            }
            let name: String = chars[name_start..i].iter().collect();
            Ok((lookup(&name).unwrap_or_default(), i))
        }
        _ => Ok(("$".to_string(), i)),
    }
}

/// Read the word of a `${VAR:-word}` / `${VAR:+word}` up to the matching
/// closing brace, keeping nested `${...}` intact.
fn read_brace_word(chars: &[char], mut i: usize) -> Result<(String, usize), ExpandError> {
    let mut depth = 0usize;
    let mut word = String::new();
    while i < chars.len() {
        match chars[i] {
            '{' => {
                depth += 1;
                word.push('{');
            }
            '}' => {
                if depth == 0 {
                    return Ok((word, i + 1));
                }
                depth -= 1;
                word.push('}');
            }
            c => word.push(c),
        }
        i += 1;
    }
    Err(ExpandError::UnterminatedBrace)
}

/// Expand `${...}` constructs inside a default/alternative word.
fn expand_word<F>(word: &str, lookup: &F) -> Result<String, ExpandError>
where
    F: Fn(&str) -> Option<String>,
{
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' {
            let (value, next) = expand_dollar(&chars, i, lookup)?;
            out.push_str(&value);
            i = next;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn is_var_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Quote a field for human-readable command echoing.
pub fn shell_quote(field: &str) -> String {
    if !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        field.to_string()
    } else {
        format!("'{}'", field.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_plain_fields() {
        let lookup = lookup_from(&[]);
        let fields = expand_fields("ssh -o BatchMode=yes host", &lookup).unwrap();
        assert_eq!(fields, vec!["ssh", "-o", "BatchMode=yes", "host"]);
    }

    #[test]
    fn test_single_quotes_suppress_expansion() {
        let lookup = lookup_from(&[("X", "value")]);
        let fields = expand_fields("echo '${X}'", &lookup).unwrap();
        assert_eq!(fields, vec!["echo", "${X}"]);
    }

    #[test]
    fn test_double_quotes_no_field_split() {
        let lookup = lookup_from(&[("X", "a b")]);
        let fields = expand_fields(r#"echo "${X}""#, &lookup).unwrap();
        assert_eq!(fields, vec!["echo", "a b"]);
    }

    #[test]
    fn test_unquoted_expansion_field_splits() {
        let lookup = lookup_from(&[("X", "a b")]);
        let fields = expand_fields("echo ${X}", &lookup).unwrap();
        assert_eq!(fields, vec!["echo", "a", "b"]);
    }

    #[test]
    fn test_simple_var() {
        let lookup = lookup_from(&[("NLHOST", "db-01")]);
        let fields = expand_fields("ssh ${NLHOST}", &lookup).unwrap();
        assert_eq!(fields, vec!["ssh", "db-01"]);
    }

    #[test]
    fn test_default_used_when_unset() {
        let lookup = lookup_from(&[]);
        let fields = expand_fields("echo ${X:-fallback}", &lookup).unwrap();
        assert_eq!(fields, vec!["echo", "fallback"]);
    }

    #[test]
    fn test_default_used_when_empty() {
        let lookup = lookup_from(&[("X", "")]);
        let fields = expand_fields("echo ${X:-fallback}", &lookup).unwrap();
        assert_eq!(fields, vec!["echo", "fallback"]);
    }

    #[test]
    fn test_default_skipped_when_set() {
        let lookup = lookup_from(&[("X", "real")]);
        let fields = expand_fields("echo ${X:-fallback}", &lookup).unwrap();
        assert_eq!(fields, vec!["echo", "real"]);
    }

    #[test]
    fn test_alt_only_when_set_and_nonempty() {
        let set = lookup_from(&[("X", "v")]);
        assert_eq!(
            expand_fields("echo ${X:+alt}", &set).unwrap(),
            vec!["echo", "alt"]
        );

        let empty = lookup_from(&[("X", "")]);
        assert_eq!(expand_fields("echo ${X:+alt} end", &empty).unwrap(), vec!["echo", "end"]);

        let unset = lookup_from(&[]);
        assert_eq!(expand_fields("echo ${X:+alt} end", &unset).unwrap(), vec!["echo", "end"]);
    }

    #[test]
    fn test_empty_expansion_drops_field() {
        let lookup = lookup_from(&[]);
        let fields = expand_fields("a ${GONE} b", &lookup).unwrap();
        assert_eq!(fields, vec!["a", "b"]);
    }

    #[test]
    fn test_default_ssh_command_with_all_vars() {
        let lookup = lookup_from(&[("NLHOST", "db-01"), ("NLPORT", "2222"), ("NLUSER", "ops")]);
        let fields =
            expand_fields(super::super::DEFAULT_SSH_SHELL_COMMAND, &lookup).unwrap();
        assert_eq!(
            fields,
            vec!["ssh", "-o", "BatchMode=yes", "-p", "2222", "ops@db-01", "/bin/sh"]
        );
    }

    #[test]
    fn test_default_ssh_command_host_only() {
        let lookup = lookup_from(&[("NLHOST", "db-01")]);
        let fields =
            expand_fields(super::super::DEFAULT_SSH_SHELL_COMMAND, &lookup).unwrap();
        assert_eq!(fields, vec!["ssh", "-o", "BatchMode=yes", "db-01", "/bin/sh"]);
    }

    #[test]
    fn test_whitespace_expansion_splits() {
        let lookup = lookup_from(&[("X", " ")]);
        let fields = expand_fields("a${X}b", &lookup).unwrap();
        assert_eq!(fields, vec!["a", "b"]);
    }

    #[test]
    fn test_command_substitution_rejected() {
        let lookup = lookup_from(&[]);
        assert_eq!(
            expand_fields("echo $(uname)", &lookup),
            Err(ExpandError::CommandSubstitution)
        );
    }

    #[test]
    fn test_unterminated_quote() {
        let lookup = lookup_from(&[]);
        assert_eq!(
            expand_fields("echo 'oops", &lookup),
            Err(ExpandError::UnterminatedQuote)
        );
    }

    #[test]
    fn test_unterminated_brace() {
        let lookup = lookup_from(&[]);
        assert_eq!(
            expand_fields("echo ${X", &lookup),
            Err(ExpandError::UnterminatedBrace)
        );
    }

    #[test]
    fn test_empty_command() {
        let lookup = lookup_from(&[]);
        assert_eq!(expand_fields("   ", &lookup), Err(ExpandError::EmptyCommand));
        assert_eq!(
            expand_fields("${GONE}", &lookup),
            Err(ExpandError::EmptyCommand)
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "plain");
        assert_eq!(shell_quote("BatchMode=yes"), "BatchMode=yes");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
