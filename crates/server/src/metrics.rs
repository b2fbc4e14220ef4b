//! Plain-text rendering of the core counters.

use msgate::Counters;

pub fn render_metrics(counters: &Counters) -> String {
	let mut out = String::new();
	for (name, value) in counters.snapshot() {
		out.push_str("msgate_");
		out.push_str(name);
		out.push(' ');
		out.push_str(&value.to_string());
		out.push('\n');
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_one_line_per_counter() {
		let counters = Counters::default();
		counters.record_message_out();
		counters.record_webhook("ok");

		let text = render_metrics(&counters);
		assert!(text.contains("msgate_messages_out_total 1\n"));
		assert!(text.contains("msgate_webhook_deliveries_total{outcome=\"ok\"} 1\n"));
		assert!(text.lines().all(|line| line.starts_with("msgate_")));
	}
}
