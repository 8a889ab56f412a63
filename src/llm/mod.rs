pub mod echo;
pub mod gemini;
