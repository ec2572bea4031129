// Copyright (c) 2024-2026, Daily
// SPDX-License-Identifier: BSD-2-Clause

//! [`ProviderConnector`] backed by the hosted providers named in
//! [`BridgeConfig`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{BridgeConfig, RealtimeSettings, SttSettings, TtsSettings};
use crate::services::deepgram::DeepgramSTTService;
use crate::services::elevenlabs::ElevenLabsTTSService;
use crate::services::openai::OpenAILlmClient;
use crate::services::openai_realtime::{OpenAIRealtimeService, TurnDetection};
use crate::services::{
    LlmClient, ProviderConnector, ProviderEvents, RealtimeService, ServiceError, SpeechToText,
    TextToSpeech,
};

/// Opens OpenAI, Deepgram and ElevenLabs sessions using process credentials.
#[derive(Debug, Clone)]
pub struct CloudConnector {
    config: Arc<BridgeConfig>,
}

impl CloudConnector {
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Self { config }
    }

    fn openai_key(&self) -> Result<&str, ServiceError> {
        self.config
            .openai_api_key
            .as_deref()
            .ok_or(ServiceError::MissingApiKey("openai"))
    }

    fn realtime_service(
        &self,
        settings: &RealtimeSettings,
    ) -> Result<OpenAIRealtimeService, ServiceError> {
        let mut svc = OpenAIRealtimeService::new(self.openai_key()?)
            .with_model(
                settings
                    .model
                    .clone()
                    .unwrap_or_else(|| self.config.openai_realtime_model.clone()),
            )
            .with_voice(settings.voice.clone())
            .with_instructions(settings.instructions.clone())
            .with_tools(settings.tools.clone())
            .with_turn_detection(TurnDetection {
                create_response: settings.auto_response,
                ..Default::default()
            });
        if let Some(url) = &self.config.openai_realtime_url {
            svc = svc.with_base_url(url.clone());
        }
        if let Some(t) = settings.temperature {
            svc = svc.with_temperature(t);
        }
        Ok(svc)
    }
}

#[async_trait]
impl ProviderConnector for CloudConnector {
    async fn connect_realtime(
        &self,
        settings: &RealtimeSettings,
    ) -> Result<(Arc<dyn RealtimeService>, ProviderEvents), ServiceError> {
        let (svc, events) = self.realtime_service(settings)?.connect().await?;
        Ok((Arc::new(svc), events))
    }

    async fn connect_stt(
        &self,
        settings: &SttSettings,
    ) -> Result<(Arc<dyn SpeechToText>, ProviderEvents), ServiceError> {
        let key = self
            .config
            .deepgram_api_key
            .as_deref()
            .ok_or(ServiceError::MissingApiKey("deepgram"))?;
        let mut svc = DeepgramSTTService::new(key)
            .with_model(settings.model.clone())
            .with_language(settings.language.clone());
        if let Some(url) = &self.config.deepgram_url {
            svc = svc.with_base_url(url.clone());
        }
        let (svc, events) = svc.connect().await?;
        Ok((Arc::new(svc), events))
    }

    async fn connect_tts(
        &self,
        settings: &TtsSettings,
    ) -> Result<(Arc<dyn TextToSpeech>, ProviderEvents), ServiceError> {
        let key = self
            .config
            .elevenlabs_api_key
            .as_deref()
            .ok_or(ServiceError::MissingApiKey("elevenlabs"))?;
        let mut svc = ElevenLabsTTSService::new(key, settings.voice_id.clone())
            .with_model(settings.model.clone())
            .with_output_format(settings.output_format.clone());
        if let Some(s) = settings.stability {
            svc = svc.with_stability(s);
        }
        if let Some(s) = settings.similarity_boost {
            svc = svc.with_similarity_boost(s);
        }
        if let Some(url) = &self.config.elevenlabs_url {
            svc = svc.with_ws_url(url.clone());
        }
        let (svc, events) = svc.connect().await?;
        Ok((Arc::new(svc), events))
    }

    fn llm(&self, model: Option<&str>) -> Option<Arc<dyn LlmClient>> {
        let key = self.config.openai_api_key.as_deref()?;
        let mut client = OpenAILlmClient::new(
            key,
            model.unwrap_or(self.config.openai_llm_model.as_str()),
        );
        if let Some(url) = &self.config.openai_base_url {
            client = client.with_base_url(url.clone());
        }
        Some(Arc::new(client))
    }
}
