use crate::audio_sink::AudioSink;
use crate::audio_source::AudioSource;
use crate::error::DeviceError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Plays back scripted reads, then repeats `fallback` forever
pub struct ScriptedSource {
    pub script: VecDeque<Result<Vec<u8>, DeviceError>>,
    pub fallback: Vec<u8>,
    pub fail_start: bool,
    pub log: CallLog,
}

impl ScriptedSource {
    pub fn new(fallback: Vec<u8>, log: CallLog) -> Self {
        Self {
            script: VecDeque::new(),
            fallback,
            fail_start: false,
            log,
        }
    }
}

#[async_trait::async_trait]
impl AudioSource for ScriptedSource {
    async fn start(&mut self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("source.start".to_string());
        if self.fail_start {
            return Err(DeviceError::NotFound("scripted".to_string()));
        }
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("source.stop".to_string());
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.script
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Records start and stop calls in the shared log
pub struct RecordingSink {
    pub log: CallLog,
}

impl RecordingSink {
    pub fn new(log: CallLog) -> Arc<Self> {
        Arc::new(Self { log })
    }
}

#[async_trait::async_trait]
impl AudioSink for RecordingSink {
    async fn start(&self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("sink.start".to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<(), DeviceError> {
        self.log.lock().unwrap().push("sink.stop".to_string());
        Ok(())
    }

    async fn play(&self, _frame: &[u8]) -> Result<(), DeviceError> {
        Ok(())
    }
}
