//! Parser for `KEY=VALUE` property dumps such as `systemctl show`.

use std::collections::BTreeMap;
use std::str::FromStr;

use super::ParseError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Props(BTreeMap<String, String>);

impl Props {
    /// Parses one `KEY=VALUE` per line. Values may contain `=`.
    ///
    /// # Errors
    ///
    /// If a non-empty line has no `=` or an empty key.
    pub fn parse(output: &str) -> Result<Self, ParseError> {
        let mut props = BTreeMap::new();
        for line in output.lines().filter(|line| !line.is_empty()) {
            let Some((key, value)) = line.split_once('=') else {
                return Err(ParseError::Malformed(line.to_owned()));
            };
            if key.is_empty() {
                return Err(ParseError::Malformed(line.to_owned()));
            }
            props.insert(key.to_owned(), value.to_owned());
        }
        Ok(Self(props))
    }

    /// # Errors
    ///
    /// If `key` is absent.
    pub fn get(&self, key: &str) -> Result<&str, ParseError> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| ParseError::MissingKey(key.to_owned()))
    }

    /// Parses the value of `key` into a typed enumeration.
    ///
    /// # Errors
    ///
    /// If `key` is absent or its value does not parse.
    pub fn parse_as<T: FromStr>(&self, key: &'static str) -> Result<T, ParseError> {
        let value = self.get(key)?;
        value.parse().map_err(|_| ParseError::InvalidField {
            field: key,
            value: value.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, strum::EnumString)]
    #[strum(serialize_all = "lowercase")]
    enum State {
        Active,
        Inactive,
    }

    #[test]
    fn parses_dump() {
        let props = Props::parse("Id=sshd.service\nActiveState=active\nEnvironment=A=1 B=2\n\n").unwrap();
        assert_eq!(props.get("Id").unwrap(), "sshd.service");
        assert_eq!(props.get("Environment").unwrap(), "A=1 B=2");
        assert_eq!(props.parse_as::<State>("ActiveState").unwrap(), State::Active);
    }

    #[test]
    fn strict_on_shape() {
        assert!(matches!(Props::parse("garbage"), Err(ParseError::Malformed(_))));
        assert!(matches!(Props::parse("=x"), Err(ParseError::Malformed(_))));

        let props = Props::parse("ActiveState=sideways").unwrap();
        assert!(matches!(
            props.parse_as::<State>("ActiveState"),
            Err(ParseError::InvalidField { .. })
        ));
        assert!(matches!(props.get("SubState"), Err(ParseError::MissingKey(_))));
    }
}
