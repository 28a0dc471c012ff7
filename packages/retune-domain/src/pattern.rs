use regex::Regex;

pub fn is_glob(pattern: &str) -> bool {
	pattern.contains('*')
}

/// Compiles a `*` glob into an anchored regex. `*` matches any run of characters, including `/`.
pub fn compile_glob(pattern: &str) -> Option<Regex> {
	let escaped = pattern.split('*').map(regex::escape).collect::<Vec<_>>().join(".*");

	Regex::new(&format!("^{escaped}$")).ok()
}

pub fn glob_matches(pattern: &str, value: &str) -> bool {
	if !is_glob(pattern) {
		return pattern == value;
	}

	compile_glob(pattern).map(|re| re.is_match(value)).unwrap_or(false)
}
