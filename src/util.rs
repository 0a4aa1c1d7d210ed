/// Renders arbitrary protocol bytes as printable ASCII for log fields.
pub fn bytes_to_human_str(input: &[u8]) -> String {
    input.escape_ascii().to_string()
}
