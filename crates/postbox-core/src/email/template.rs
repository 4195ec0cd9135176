//! Welcome email body.

/// Render the HTML body of the welcome email.
#[must_use]
pub fn welcome_body(user_name: &str) -> String {
    let name = escape_html(user_name);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Welcome!</title>
</head>
<body>
    <h1>Welcome to Backend Challenge, {name}!</h1>
    <p>Thank you for signing up! We're excited to have you on board.</p>
    <p>Best regards,<br>The Backend Challenge Team</p>
</body>
</html>
"#
    )
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
