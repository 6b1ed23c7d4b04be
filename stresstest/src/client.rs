use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;

pub struct ChunkyardClient {
    pub base_url: String,
    pub client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub size_bytes: u64,
    pub hash: String,
}

pub enum Combined {
    Artifact(Artifact),
    /// Another combine of the same upload was running.
    Conflict,
}

impl ChunkyardClient {
    pub async fn upload_chunk(
        &self,
        upload_id: &str,
        chunk_index: u32,
        total_chunks: u32,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let url = format!("{}/upload/{upload_id}/{chunk_index}", self.base_url);
        let total_chunks = total_chunks.to_string();
        self.client
            .post(url)
            .query(&[
                ("total_chunks", total_chunks.as_str()),
                ("name", name),
                ("mime_type", "application/octet-stream"),
            ])
            .body(bytes)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("uploading chunk {chunk_index} of {upload_id}"))?;

        Ok(())
    }

    pub async fn combine(&self, upload_id: &str) -> Result<Combined> {
        let url = format!("{}/combine-chunks/{upload_id}", self.base_url);
        let response = self.client.post(url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Combined::Artifact(response.json().await?)),
            StatusCode::CONFLICT => {
                let body = response.text().await?;
                // an incomplete upload is a 409 as well, but that must never happen here
                if body.contains("\"missing\"") {
                    bail!("combining {upload_id}: {body}");
                }
                Ok(Combined::Conflict)
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("combining {upload_id}: {status}: {body}")
            }
        }
    }
}
