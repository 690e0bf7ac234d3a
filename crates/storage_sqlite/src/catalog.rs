use core_types::ProviderName;

/// A provider row as shipped with the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSeed {
    pub id: i64,
    pub name: ProviderName,
    pub description: &'static str,
    pub models: &'static [&'static str],
}

pub fn builtin_providers() -> Vec<ProviderSeed> {
    vec![
        ProviderSeed {
            id: 1,
            name: ProviderName::Qianfan,
            description: "文心一言 百度出品的大模型",
            models: &[
                "ERNIE-4.0-8K",
                "ERNIE-4.0-Turbo-8K",
                "ERNIE-3.5-8K",
                "ERNIE-Speed-8K",
                "ERNIE-Speed-128K",
                "ERNIE-Lite-8K",
                "ERNIE-Tiny-8K",
            ],
        },
        ProviderSeed {
            id: 2,
            name: ProviderName::DashScope,
            description: "通义千问",
            models: &["qwen-turbo", "qwen-plus", "qwen-max", "qwen-vl-plus"],
        },
        ProviderSeed {
            id: 3,
            name: ProviderName::DeepSeek,
            description: "DeepSeek",
            models: &["deepseek-chat", "deepseek-reasoner"],
        },
        ProviderSeed {
            id: 4,
            name: ProviderName::OpenAi,
            description: "OpenAI GPT models",
            models: &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo"],
        },
    ]
}

pub fn builtin_provider(name: ProviderName) -> Option<ProviderSeed> {
    builtin_providers().into_iter().find(|seed| seed.name == name)
}
