/// Version of the prompt templates and of the output contract they request.
pub const PROMPT_VERSION: &str = "v1";

const OUTPUT_CONTRACT: &str = r#"OUTPUT FORMAT:
Q: <the question, on one line>
A: <the answer>

Output ONLY these two lines, no markdown, no explanations."#;

pub fn build_single_hop_prompt(passage: &str) -> String {
    format!(
        r#"Write one question that can be answered from the passage below, and its answer.

INSTRUCTIONS:
1. The question must be answerable using only this passage
2. Ask for a specific fact, not an opinion or a summary
3. The question must make sense without seeing the passage
4. The answer must be short and taken from the passage

PASSAGE:
{}

{}"#,
        passage.trim(),
        OUTPUT_CONTRACT
    )
}

pub fn build_multi_hop_prompt(passages: &[&str]) -> String {
    let numbered = passages
        .iter()
        .enumerate()
        .map(|(i, passage)| format!("[Passage {}]\n{}", i + 1, passage.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        r#"Write one question that can only be answered by combining facts from ALL of the passages below, and its answer.

INSTRUCTIONS:
1. Each passage must contribute a fact needed for the answer
2. The question must not be answerable from any single passage
3. Do not mention the passages or their numbers in the question
4. The answer must be short and supported by the passages

PASSAGES:
{}

{}"#,
        numbered, OUTPUT_CONTRACT
    )
}
