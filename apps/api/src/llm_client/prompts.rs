//! Screening prompts. The scoring capability receives one job description
//! plus the batch of CV references and must return one JSON array entry per
//! application.

use crate::screening::batch::BatchApplication;

pub const SCREENING_SYSTEM: &str = "You are a precise resume screening assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON array. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Builds the batch screening prompt. Applications are listed in submission
/// order; the model must echo each `application_id` back unchanged.
pub fn screening_prompt(title: &str, description: &str, applications: &[BatchApplication]) -> String {
    let mut prompt = String::with_capacity(1024 + applications.len() * 96);
    prompt.push_str("Score every candidate CV below against this job.\n\n");
    prompt.push_str("JOB TITLE:\n");
    prompt.push_str(title);
    prompt.push_str("\n\nJOB DESCRIPTION AND REQUIREMENTS:\n");
    prompt.push_str(description);
    prompt.push_str("\n\nCANDIDATES:\n");
    for application in applications {
        prompt.push_str(&format!(
            "- application_id: {} | cv: {}\n",
            application.application_id, application.cv_ref
        ));
    }
    prompt.push_str(
        "\nReturn a JSON array with EXACTLY one entry per candidate:\n\
         [{\"application_id\": \"<uuid, echoed unchanged>\", \
         \"score\": <integer 0-100>, \
         \"reasoning\": \"<one or two sentences>\"}]\n\
         Score on fit with the stated requirements only. \
         Do not invent candidates and do not omit any.",
    );
    prompt
}
