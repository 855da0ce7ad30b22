//! Mustache-style `{{var}}` substitution for argv tokens.
//!
//! Two variables are available to commands: `{{path}}`, the path that
//! triggered the restart relative to the working directory, and `{{op}}`,
//! the lowercase event kind. On the initial run both render empty. Unknown
//! variables also render empty; tokens without any `{{…}}` pass through
//! unchanged.

/// Render one token against the variable map.
pub fn render(token: &str, vars: &[(&str, &str)]) -> String {
	let mut out = String::with_capacity(token.len());
	let mut rest = token;

	while let Some(start) = rest.find("{{") {
		let after = &rest[start + 2..];
		let Some(end) = after.find("}}") else {
			break;
		};

		out.push_str(&rest[..start]);
		let name = after[..end].trim();
		if let Some((_, value)) = vars.iter().find(|(key, _)| *key == name) {
			out.push_str(value);
		}
		rest = &after[end + 2..];
	}

	out.push_str(rest);
	out
}

/// Render a whole argv.
pub fn render_argv(argv: &[String], path: &str, op: &str) -> Vec<String> {
	let vars = [("path", path), ("op", op)];
	argv.iter().map(|token| render(token, &vars)).collect()
}
