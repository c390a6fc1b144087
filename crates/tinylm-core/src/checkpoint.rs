use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use log::warn;
use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tch::{nn, Device, Kind, Tensor};

use crate::error::{Error, Result};

/// Writes every variable of `vs` as f32 to `path`.
///
/// The file is written next to `path` and renamed over it, so readers only
/// ever see a complete checkpoint.
pub fn save_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let path = path.as_ref();
    let _guard = tch::no_grad_guard();

    let mut tensors: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (name, var) in vs.variables() {
        let cpu = var.detach().to_device(Device::Cpu).to_kind(Kind::Float).contiguous();
        let shape: Vec<usize> = cpu.size().iter().map(|&d| d as usize).collect();
        let values = Vec::<f32>::try_from(&cpu.flatten(0, -1))?;
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        tensors.push((name, shape, bytes));
    }

    let views = tensors
        .iter()
        .map(|(name, shape, bytes)| {
            Ok((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?))
        })
        .collect::<Result<Vec<_>>>()?;

    let tmp = temp_path(path);
    safetensors::serialize_to_file(views, &None::<HashMap<String, String>>, &tmp)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Copies the tensors stored at `path` into the matching variables of `vs`.
/// Every variable of `vs` must be present in the file.
pub fn load_safetensors<P: AsRef<Path>>(vs: &nn::VarStore, path: P) -> Result<()> {
    let file = File::open(path)?;
    let buffer = unsafe { MmapOptions::new().map(&file)? };
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut variables = vs.variables();
    let device = vs.device();

    for (name, view) in tensors.tensors() {
        let Some(var) = variables.get_mut(&name) else {
            warn!("tensor {name} found in checkpoint but not in model");
            continue;
        };

        let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
        if shape != var.size() {
            return Err(Error::InvalidInput(format!(
                "checkpoint tensor {name} has shape {shape:?}, model expects {:?}",
                var.size()
            )));
        }
        let kind = match view.dtype() {
            Dtype::F32 => Kind::Float,
            Dtype::F16 => Kind::Half,
            Dtype::BF16 => Kind::BFloat16,
            other => return Err(Error::InvalidInput(format!("unsupported dtype {other:?}"))),
        };

        let value = Tensor::from_data_size(view.data(), &shape, kind)
            .to_kind(var.kind())
            .to_device(device);
        tch::no_grad(|| var.copy_(&value));
        variables.remove(&name);
    }

    if !variables.is_empty() {
        let mut missing: Vec<_> = variables.into_keys().collect();
        missing.sort();
        return Err(Error::InvalidInput(format!("checkpoint lacks tensors {missing:?}")));
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
