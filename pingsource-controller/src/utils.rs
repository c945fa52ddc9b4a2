pub(crate) fn metric_name(name: &str) -> String {
    format!("pingsource_{}", name)
}
