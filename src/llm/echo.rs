//! Offline stand-in for the hosted services. Lets the UI run without a key.

use std::{io::Cursor, sync::Arc};

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::sys::{
    llm::{
        ChatBackend, ChatChunk, ChatConfig, ChatSession, ChatStream, LlmError, Portrait,
        PortraitGenerator, ProfileGenerator,
    },
    NpcProfile,
};

const FRAGMENT_CHARS: usize = 3;

pub struct EchoBackend;

impl ProfileGenerator for EchoBackend {
    fn generate_profile(&self, _prompt: &str) -> Result<NpcProfile, LlmError> {
        Ok(NpcProfile {
            name: "回声".to_string(),
            personality: "安静，好奇，只会重复听到的话".to_string(),
            backstory: "住在一株蕨类植物的叶脉里，从未见过光以外的东西。".to_string(),
            current_activity: "数叶片上的露水".to_string(),
            image_prompt: "a faint glowing figure made of fern leaves".to_string(),
            first_message: "……有声音？是你在叶子那边说话吗。".to_string(),
        })
    }
}

impl ChatBackend for EchoBackend {
    fn create(&self, config: ChatConfig) -> Result<Arc<dyn ChatSession>, LlmError> {
        log::debug!("echo session, instruction of {} bytes", config.system_instruction.len());
        Ok(Arc::new(EchoSession))
    }
}

struct EchoSession;

impl ChatSession for EchoSession {
    fn send_message_stream(&self, text: &str) -> Result<ChatStream<'_>, LlmError> {
        let reply: Vec<char> = format!("「{}」……我听见了。", text.trim()).chars().collect();
        let chunks: Vec<_> = reply
            .chunks(FRAGMENT_CHARS)
            .map(|c| {
                Ok(ChatChunk {
                    text: c.iter().collect(),
                })
            })
            .collect();
        Ok(Box::new(chunks.into_iter()))
    }
}

impl PortraitGenerator for EchoBackend {
    fn generate_portrait(&self, _prompt: &str) -> Result<Portrait, LlmError> {
        let (w, h) = (96, 128);
        let image = RgbaImage::from_fn(w, h, |x, y| {
            let dx = x as f32 / w as f32 - 0.5;
            let dy = y as f32 / h as f32 - 0.45;
            let glow = (1.0 - (dx * dx + dy * dy).sqrt() * 2.2).clamp(0.0, 1.0);
            Rgba([
                (20.0 + 60.0 * glow) as u8,
                (40.0 + 200.0 * glow) as u8,
                (30.0 + 120.0 * glow) as u8,
                255,
            ])
        });

        let mut bytes = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(Portrait {
            mime_type: "image/png".to_string(),
            bytes,
        })
    }
}
