//! Fixed registry of known instruction templates. Each entry wraps the user
//! turn in the chat format the language backbone was fine-tuned with and
//! names the stop words that end an assistant turn.

pub struct PromptTemplate {
    pub name: &'static str,
    /// Instruction format string with an `{input}` placeholder.
    pub instruction: &'static str,
    pub stop_words: &'static [&'static str],
}

const TEMPLATES: &[PromptTemplate] = &[
    PromptTemplate {
        name: "vicuna",
        instruction: "USER: {input} ASSISTANT:",
        stop_words: &[],
    },
    PromptTemplate {
        name: "llama2_chat",
        instruction: "[INST] {input} [/INST]",
        stop_words: &[],
    },
    PromptTemplate {
        name: "internlm_chat",
        instruction: "<|User|>:{input}<eoh>\n<|Bot|>:",
        stop_words: &["<eoa>"],
    },
    PromptTemplate {
        name: "internlm2_chat",
        instruction: "<|im_start|>user\n{input}<|im_end|>\n<|im_start|>assistant\n",
        stop_words: &["<|im_end|>"],
    },
    PromptTemplate {
        name: "qwen_chat",
        instruction: "<|im_start|>user\n{input}<|im_end|>\n<|im_start|>assistant\n",
        stop_words: &["<|im_end|>", "<|endoftext|>"],
    },
];

pub fn lookup(name: &str) -> Option<&'static PromptTemplate> {
    TEMPLATES.iter().find(|t| t.name == name)
}

impl PromptTemplate {
    pub fn apply(&self, input: &str) -> String {
        self.instruction.replace("{input}", input)
    }
}
