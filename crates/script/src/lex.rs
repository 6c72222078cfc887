//! The script language's scanner, implemented via [Logos](logos).

#[derive(logos::Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"//[^\n]*")]
#[logos(skip r"/[*]([^*]|([*][^/]))*[*]+/")]
pub enum Token {
	// Literals ////////////////////////////////////////////////////////////////
	#[regex(r"[0-9]+\.[0-9]*([Ee][+-]?[0-9]+)?", priority = 3)]
	#[regex(r"[0-9]+[Ee][+-]?[0-9]+", priority = 3)]
	FloatLit,
	#[regex("0[xX][a-fA-F0-9]+", priority = 4)]
	#[regex(r"[0-9]+", priority = 2)]
	IntLit,
	#[regex(r#""(([\\].)|[^"\\])*""#)]
	StringLit,
	// Keywords ////////////////////////////////////////////////////////////////
	#[regex("(?i)break", priority = 5)]
	KwBreak,
	#[regex("(?i)case", priority = 5)]
	KwCase,
	#[regex("(?i)const", priority = 5)]
	KwConst,
	#[regex("(?i)continue", priority = 5)]
	KwContinue,
	#[regex("(?i)default", priority = 5)]
	KwDefault,
	#[regex("(?i)else", priority = 5)]
	KwElse,
	#[regex("(?i)external", priority = 5)]
	KwExternal,
	#[regex("(?i)false", priority = 5)]
	KwFalse,
	#[regex("(?i)for", priority = 5)]
	KwFor,
	#[regex("(?i)function", priority = 5)]
	KwFunction,
	#[regex("(?i)global", priority = 5)]
	KwGlobal,
	#[regex("(?i)if", priority = 5)]
	KwIf,
	#[regex("(?i)method", priority = 5)]
	KwMethod,
	#[regex("(?i)new", priority = 5)]
	KwNew,
	#[regex("(?i)null", priority = 5)]
	KwNull,
	#[regex("(?i)on", priority = 5)]
	KwOn,
	#[regex("(?i)return", priority = 5)]
	KwReturn,
	#[regex("(?i)switch", priority = 5)]
	KwSwitch,
	#[regex("(?i)this", priority = 5)]
	KwThis,
	#[regex("(?i)true", priority = 5)]
	KwTrue,
	#[regex("(?i)var", priority = 5)]
	KwVar,
	#[regex("(?i)while", priority = 5)]
	KwWhile,
	// Glyphs //////////////////////////////////////////////////////////////////
	#[token("&&")]
	Ampersand2,
	#[token("!")]
	Bang,
	#[token("!=")]
	BangEq,
	#[token("!==")]
	BangEq2,
	#[token("{")]
	BraceL,
	#[token("}")]
	BraceR,
	#[token("[")]
	BracketL,
	#[token("]")]
	BracketR,
	#[token(":")]
	Colon,
	#[token(",")]
	Comma,
	#[token(".")]
	Dot,
	#[token("=")]
	Eq,
	#[token("==")]
	Eq2,
	#[token("===")]
	Eq3,
	#[token("<")]
	AngleL,
	#[token("<=")]
	AngleLEq,
	#[token(">")]
	AngleR,
	#[token(">=")]
	AngleREq,
	#[token("-")]
	Minus,
	#[token("-=")]
	MinusEq,
	#[token("(")]
	ParenL,
	#[token(")")]
	ParenR,
	#[token("%")]
	Percent,
	#[token("%=")]
	PercentEq,
	#[token("||")]
	Pipe2,
	#[token("+")]
	Plus,
	#[token("+=")]
	PlusEq,
	#[token("?")]
	Question,
	#[token(";")]
	Semicolon,
	#[token("/")]
	Slash,
	#[token("/=")]
	SlashEq,
	#[token("*")]
	Asterisk,
	#[token("*=")]
	AsteriskEq,
	// Miscellaneous ///////////////////////////////////////////////////////////
	#[regex("[a-zA-Z_][a-zA-Z0-9_]*", priority = 4)]
	Ident,
	Unknown,
}

/// Scans the whole source up front. Error tokens become [`Token::Unknown`]
/// so the parser can report them with a position instead of panicking.
#[must_use]
pub fn scan(source: &str) -> Vec<(Token, logos::Span)> {
	logos::Logos::lexer(source)
		.spanned()
		.map(|(result, span)| (result.unwrap_or(Token::Unknown), span))
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn smoke() {
		const SOURCE: &str = r#"
		// entry
		var x = 0x10;
		function Touch(a, b) { return a + b * 2.5; }
		on "LeftClick" { Game.Msg("clicked \"here\""); }
		"#;

		let tokens: Vec<Token> = scan(SOURCE).into_iter().map(|(t, _)| t).collect();

		assert!(tokens.contains(&Token::KwVar));
		assert!(tokens.contains(&Token::IntLit));
		assert!(tokens.contains(&Token::FloatLit));
		assert!(tokens.contains(&Token::KwOn));
		assert!(tokens.contains(&Token::StringLit));
		assert!(!tokens.contains(&Token::Unknown));
	}

	#[test]
	fn keywords_are_case_insensitive() {
		let tokens: Vec<Token> = scan("VAR If WHILE function")
			.into_iter()
			.map(|(t, _)| t)
			.collect();

		assert_eq!(
			tokens,
			vec![Token::KwVar, Token::KwIf, Token::KwWhile, Token::KwFunction]
		);
	}

	#[test]
	fn keyword_prefixed_idents() {
		let tokens: Vec<Token> = scan("iffy formal onX").into_iter().map(|(t, _)| t).collect();
		assert_eq!(tokens, vec![Token::Ident, Token::Ident, Token::Ident]);
	}

	#[test]
	fn glyph_maximal_munch() {
		let tokens: Vec<Token> = scan("= == === != !==").into_iter().map(|(t, _)| t).collect();

		assert_eq!(
			tokens,
			vec![
				Token::Eq,
				Token::Eq2,
				Token::Eq3,
				Token::BangEq,
				Token::BangEq2,
			]
		);
	}
}
