//! Code resolver: alias substitution and hexadecimal to decimal conversion

use tracing::debug;

use super::alias::AliasTable;
use super::error::CodeError;
use super::{parse_hex, CODE_SEPARATOR};

/// Resolves code tokens against a fixed alias table
#[derive(Debug, Clone, Default)]
pub struct CodeResolver {
    aliases: AliasTable,
}

impl CodeResolver {
    pub fn new(aliases: AliasTable) -> Self {
        Self { aliases }
    }

    /// Resolves a single token into its decimal string
    ///
    /// An alias name is replaced by its code first, any other token is read
    /// as hexadecimal directly.
    pub fn resolve_token(&self, token: &str) -> Result<String, CodeError> {
        let hex = self.aliases.get(token).unwrap_or(token);
        parse_hex(hex)
            .map(|value| value.to_string())
            .ok_or_else(|| CodeError::InvalidCodeFormat {
                token: token.to_string(),
                value: hex.to_string(),
            })
    }

    /// Lazily resolves tokens in order, one output per input
    pub fn resolve<'a, I>(
        &'a self,
        tokens: I,
    ) -> impl Iterator<Item = Result<String, CodeError>> + 'a
    where
        I: IntoIterator,
        I::IntoIter: 'a,
        I::Item: AsRef<str>,
    {
        tokens
            .into_iter()
            .map(move |token| self.resolve_token(token.as_ref()))
    }

    /// Builds the `;` separated command string, failing on the first bad token
    pub fn command_string<I>(&self, tokens: I) -> Result<String, CodeError>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let codes = self.resolve(tokens).collect::<Result<Vec<_>, _>>()?;
        let command = codes.join(CODE_SEPARATOR);
        debug!("Resolved {} codes into {:?}", codes.len(), command);
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> CodeResolver {
        CodeResolver::new(AliasTable::from_csv("power,E0E040BF\nmute,0xE0E0F00F").unwrap())
    }

    #[test]
    fn alias_resolves_to_aliased_value() {
        let r = resolver();
        assert_eq!(r.resolve_token("power").unwrap(), "3772793023");
        assert_eq!(r.resolve_token("mute").unwrap(), "3772837903");
    }

    #[test]
    fn unknown_token_is_read_as_hex() {
        let r = resolver();
        assert_eq!(r.resolve_token("1A2B3C4D").unwrap(), "439041101");
        assert_eq!(r.resolve_token("ff").unwrap(), "255");
    }

    #[test]
    fn alias_names_shadow_hex_tokens() {
        let r = CodeResolver::new(AliasTable::from_csv("FF,10").unwrap());
        assert_eq!(r.resolve_token("FF").unwrap(), "16");
    }

    #[test]
    fn preserves_length_and_order() {
        let r = resolver();
        let tokens = ["1", "power", "A", "2", "mute", "B"];
        let out: Vec<String> = r.resolve(tokens).map(Result::unwrap).collect();
        assert_eq!(
            out,
            vec!["1", "3772793023", "10", "2", "3772837903", "11"]
        );
    }

    #[test]
    fn resolving_twice_is_identical() {
        let r = resolver();
        let tokens = vec!["power".to_string(), "1A2B3C4D".to_string()];
        let first = r.command_string(&tokens).unwrap();
        let second = r.command_string(&tokens).unwrap();
        assert_eq!(first, second);
        assert_eq!(r.resolve_token("power").unwrap(), "3772793023");
    }

    #[test]
    fn builds_command_string() {
        let r = resolver();
        assert_eq!(
            r.command_string(["power", "1A2B3C4D"]).unwrap(),
            "3772793023;439041101"
        );
        assert_eq!(r.command_string(Vec::<String>::new()).unwrap(), "");
    }

    #[test]
    fn invalid_token_fails_whole_command() {
        let r = resolver();
        let err = r.command_string(["power", "ZZZZ", "1A"]).unwrap_err();
        assert_eq!(
            err,
            CodeError::InvalidCodeFormat {
                token: "ZZZZ".to_string(),
                value: "ZZZZ".to_string(),
            }
        );
    }

    #[test]
    fn resolve_is_lazy() {
        let r = resolver();
        let mut iter = r.resolve(["power", "ZZZZ"]);
        assert_eq!(iter.next(), Some(Ok("3772793023".to_string())));
        assert!(matches!(iter.next(), Some(Err(CodeError::InvalidCodeFormat { .. }))));
        assert_eq!(iter.next(), None);
    }
}
