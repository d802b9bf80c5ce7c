// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Command handlers. Each handler takes the capability context and the
// packet and returns (status, result); anything it cannot recover from
// propagates as an error and becomes RSP_ERROR/0 at the dispatch boundary.

use tracing::{info, warn};

use crate::arbiter::{query_next_profile, Decision};
use crate::bridge::{Bridge, HandlerCtx, OBS_BLOB_SIZE};
use crate::error::{BridgeError, Result};
use crate::ifr::{parse_ifr, persist_record};
use crate::proto::{
    timestamp_usec, ObsEntry, Packet, unpack_step_payload, BLOB_TYPE_RAW, BLOB_TYPE_TENSOR,
    CMD_ARB_EPISODE, CMD_ENV_RESET, CMD_ENV_STEP, CMD_HEAP_STATS, CMD_IFR_PERSIST,
    CMD_MODEL_LOAD, CMD_PING, CMD_PRINT, CMD_RUN_MODEL, CMD_TELEMETRY_POLL, CMD_TENSOR_ALLOC,
    CMD_TENSOR_FREE, RSP_ERROR, RSP_OK,
};
use crate::tensor::{Tensor, TensorView};

/// Linear policy weights uploaded for the kernel on first ENV_RESET.
/// Heuristic CartPole balance: angle and the two velocities, position free.
const POLICY_WEIGHTS: [f32; 4] = [0.0, 0.5, 1.0, 0.5];

/// The `payload_id` bit requesting streaming mode on ENV_RESET.
const ENV_RESET_STREAM_BIT: u32 = 0x1;

pub fn register_all(bridge: &mut Bridge) {
    bridge.register_handler(CMD_PING, handle_ping);
    bridge.register_handler(CMD_PRINT, handle_print);
    bridge.register_handler(CMD_RUN_MODEL, handle_run_model);
    bridge.register_handler(CMD_TENSOR_ALLOC, handle_tensor_alloc);
    bridge.register_handler(CMD_TENSOR_FREE, handle_tensor_free);
    bridge.register_handler(CMD_HEAP_STATS, handle_heap_stats);
    bridge.register_handler(CMD_MODEL_LOAD, handle_model_load);
    bridge.register_handler(CMD_ENV_RESET, handle_env_reset);
    bridge.register_handler(CMD_ENV_STEP, handle_env_step);
    bridge.register_handler(CMD_IFR_PERSIST, handle_ifr_persist);
    bridge.register_handler(CMD_TELEMETRY_POLL, handle_telemetry_poll);
    bridge.register_handler(CMD_ARB_EPISODE, handle_arb_episode);
    info!("registered 12 command handlers");
}

// ---------------------------------------------------------------------------
// Core commands
// ---------------------------------------------------------------------------

pub fn handle_ping(_ctx: &mut HandlerCtx<'_>, _packet: &Packet) -> Result<(u16, u32)> {
    info!("PING -> PONG");
    Ok((RSP_OK, 0))
}

/// Surface a NUL-terminated UTF-8 string from a heap blob.
pub fn handle_print(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    if packet.payload_id == 0 {
        info!("PRINT (no payload)");
        return Ok((RSP_OK, 0));
    }
    let data = ctx.heap.read_blob_data(packet.payload_id as u16)?;
    let text_bytes = data.split(|&b| b == 0).next().unwrap_or(&[]);
    let text = String::from_utf8_lossy(text_bytes);
    info!(kernel = %text, "PRINT");
    Ok((RSP_OK, 0))
}

/// Run inference on the referenced tensor blob, returning the result blob.
pub fn handle_run_model(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    if packet.payload_id == 0 {
        return Err(BridgeError::Handler("RUN_MODEL without input tensor".into()));
    }

    // Copy the input out of the mapping so the heap borrow ends before the
    // result allocation below.
    let (dims, values) = {
        let view = ctx.heap.read_tensor(packet.payload_id as u16)?;
        (view.dims().to_vec(), view.to_f32_vec())
    };

    let key = if dims == [1, 784] { "linear" } else { "default" };
    let model = ctx.models.get_or_load(key)?;

    let input = Tensor::from_f32(&dims, &values)?;
    let input_view = TensorView::new(input.header, &input.data)?;
    let output = model.forward(&input_view)?;

    let result_id = ctx.heap.allocate_tensor(&output)?;
    info!(
        input_shape = ?dims,
        output_shape = ?output.dims(),
        model = key,
        result = result_id,
        "RUN_MODEL"
    );
    Ok((RSP_OK, result_id as u32))
}

// ---------------------------------------------------------------------------
// Heap commands
// ---------------------------------------------------------------------------

/// `payload_id` is the byte size to allocate (0 means 1024).
pub fn handle_tensor_alloc(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    let size = if packet.payload_id == 0 {
        1024
    } else {
        packet.payload_id as usize
    };
    let blob_id = ctx.heap.allocate_blob(size, BLOB_TYPE_TENSOR)?;
    Ok((RSP_OK, blob_id as u32))
}

pub fn handle_tensor_free(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    if packet.payload_id == 0 {
        return Err(BridgeError::NotFound(0));
    }
    ctx.heap.free_blob(packet.payload_id as u16)?;
    Ok((RSP_OK, 0))
}

pub fn handle_heap_stats(ctx: &mut HandlerCtx<'_>, _packet: &Packet) -> Result<(u16, u32)> {
    let stats = ctx.heap.stats();
    info!(
        total_blocks = stats.total_blocks,
        free_blocks = stats.free_blocks,
        used_blocks = stats.used_blocks,
        next_blob_id = stats.next_blob_id,
        "HEAP_STATS"
    );
    Ok((RSP_OK, stats.free_blocks))
}

/// Preload a model; `payload_id` optionally names it via a string blob.
pub fn handle_model_load(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    let name = if packet.payload_id == 0 {
        "default".to_owned()
    } else {
        let data = ctx.heap.read_blob_data(packet.payload_id as u16)?;
        let bytes = data.split(|&b| b == 0).next().unwrap_or(&[]);
        String::from_utf8_lossy(bytes).into_owned()
    };
    ctx.models.get_or_load(&name)?;
    info!(model = %name, "MODEL_LOAD");
    Ok((RSP_OK, 0))
}

// ---------------------------------------------------------------------------
// IFR and telemetry
// ---------------------------------------------------------------------------

/// Decode the referenced IFR and persist it as a .bin/.json pair. A valid
/// parse with a failing hash is still persisted but answers ERROR.
pub fn handle_ifr_persist(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    let raw = ctx.heap.read_blob_data(packet.payload_id as u16)?;
    let record = parse_ifr(&raw)
        .ok_or_else(|| BridgeError::Decode("payload is not an IFR record".into()))?;

    let (bin_path, _json_path) = persist_record(&ctx.config.ifr_dir, &raw, &record)?;
    info!(
        path = %bin_path.display(),
        version = record.version(),
        hash_ok = record.hash_ok(),
        "IFR_PERSIST"
    );

    if record.hash_ok() {
        Ok((RSP_OK, 0))
    } else {
        warn!(job = record.job_id(), episode = record.episode_id(), "IFR hash mismatch");
        Ok((RSP_ERROR, 0))
    }
}

fn env_f32(name: &str, default: f32) -> f32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Synthesise a telemetry snapshot into a RAW blob:
/// ts_usec:u64, gpu_temp:f32, rdma_qp_depth:f32, numa_locality:f32.
pub fn handle_telemetry_poll(ctx: &mut HandlerCtx<'_>, _packet: &Packet) -> Result<(u16, u32)> {
    let mut snapshot = [0u8; 20];
    snapshot[0..8].copy_from_slice(&timestamp_usec().to_le_bytes());
    snapshot[8..12].copy_from_slice(&env_f32("ZENEDGE_GPU_TEMP_C", 45.0).to_le_bytes());
    snapshot[12..16].copy_from_slice(&env_f32("ZENEDGE_RDMA_QP_DEPTH", 0.0).to_le_bytes());
    snapshot[16..20].copy_from_slice(&env_f32("ZENEDGE_NUMA_LOCALITY", 1.0).to_le_bytes());

    let blob_id = ctx.heap.allocate_blob(snapshot.len(), BLOB_TYPE_RAW)?;
    ctx.heap.write_blob_data(blob_id, &snapshot)?;
    Ok((RSP_OK, blob_id as u32))
}

// ---------------------------------------------------------------------------
// Environment commands
// ---------------------------------------------------------------------------

/// Step data layout: obs[4], reward, done, model blob id as f32 (7 floats).
fn pack_step_data(obs: [f32; 4], reward: f32, done: f32, model_blob_id: u16) -> [u8; 28] {
    let mut buf = [0u8; 28];
    for (i, v) in obs.iter().enumerate() {
        buf[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    buf[16..20].copy_from_slice(&reward.to_le_bytes());
    buf[20..24].copy_from_slice(&done.to_le_bytes());
    buf[24..28].copy_from_slice(&(model_blob_id as f32).to_le_bytes());
    buf
}

fn upload_policy(ctx: &mut HandlerCtx<'_>) -> Result<()> {
    if ctx.session.policy_blob_id != 0 {
        return Ok(());
    }
    let mut bytes = [0u8; 16];
    for (i, w) in POLICY_WEIGHTS.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
    }
    let id = ctx.heap.allocate_blob(bytes.len(), BLOB_TYPE_RAW)?;
    ctx.heap.write_blob_data(id, &bytes)?;
    ctx.session.policy_blob_id = id;
    info!(blob = id, "uploaded linear policy");
    Ok(())
}

/// Reset the environment. With the stream bit set and healthy stream rings
/// the session enters streaming mode and the initial observation goes out
/// through the obs ring; otherwise it lands in a pooled blob.
pub fn handle_env_reset(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    upload_policy(ctx)?;
    ctx.session.obs_pool.ensure_allocated(ctx.heap)?;

    let obs = ctx.session.env.reset();
    let stream_requested = packet.payload_id & ENV_RESET_STREAM_BIT != 0;

    if stream_requested && ctx.streams.ready() {
        ctx.session.streaming = true;
        let entry = ObsEntry {
            seq: 0,
            obs,
            reward: 0.0,
            done: 0.0,
            model_id: ctx.session.policy_blob_id as f32,
        };
        ctx.streams.push_obs(&entry)?;
        info!(env = ctx.session.env.name(), "ENV_RESET streaming");
        return Ok((RSP_OK, 0));
    }

    ctx.session.streaming = false;
    let blob_id = ctx
        .session
        .obs_pool
        .acquire()
        .ok_or_else(|| BridgeError::Handler("obs pool empty".into()))?;
    let data = pack_step_data(obs, 0.0, 0.0, ctx.session.policy_blob_id);
    debug_assert!(data.len() <= OBS_BLOB_SIZE);
    ctx.heap.write_blob_data(blob_id, &data)?;
    info!(env = ctx.session.env.name(), blob = blob_id, "ENV_RESET");
    Ok((RSP_OK, blob_id as u32))
}

/// Step the environment. `payload_id` packs the ack blob id (high half)
/// and the action (low half). Refused while streaming is active.
pub fn handle_env_step(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    if ctx.session.streaming {
        warn!("ENV_STEP refused while streaming");
        return Ok((RSP_ERROR, 0));
    }

    let (action, ack_blob_id) = unpack_step_payload(packet.payload_id);
    if ack_blob_id != 0 {
        ctx.session.obs_pool.ack(ack_blob_id);
    }

    let outcome = ctx.session.env.step(action);
    let blob_id = ctx
        .session
        .obs_pool
        .acquire()
        .ok_or_else(|| BridgeError::Handler("obs pool empty".into()))?;
    let data = pack_step_data(
        outcome.obs,
        outcome.reward,
        if outcome.done() { 1.0 } else { 0.0 },
        ctx.session.policy_blob_id,
    );
    ctx.heap.write_blob_data(blob_id, &data)?;
    Ok((RSP_OK, blob_id as u32))
}

// ---------------------------------------------------------------------------
// Arbitration
// ---------------------------------------------------------------------------

/// Verify the referenced IFR, consult the arbiter, and drive the model
/// lifecycle. Result packs `(decision_code << 16) | (model_id & 0xFFFF)`.
pub fn handle_arb_episode(ctx: &mut HandlerCtx<'_>, packet: &Packet) -> Result<(u16, u32)> {
    let raw = ctx.heap.read_blob_data(packet.payload_id as u16)?;
    let record = parse_ifr(&raw)
        .ok_or_else(|| BridgeError::Decode("payload is not an IFR record".into()))?;
    if !record.hash_ok() {
        warn!(
            job = record.job_id(),
            episode = record.episode_id(),
            "arbitrating episode with failed integrity check"
        );
    }

    let answer = query_next_profile(ctx.config.arbiter_url.as_deref(), &raw, &record);
    let decision = answer.decision.unwrap_or(Decision::Keep);
    let model_id = ctx
        .session
        .lifecycle
        .apply(decision, answer.recommended_model_id);

    info!(
        episode = record.episode_id(),
        ?decision,
        model_id,
        state = ?ctx.session.lifecycle.state,
        "ARB_EPISODE"
    );
    Ok((RSP_OK, ((decision.code() as u32) << 16) | (model_id & 0xFFFF)))
}
