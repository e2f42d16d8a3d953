use crate::controller::ModelFunctionChannel;
use crate::signal::Channel;
use crate::signal::vector::SignalVector;

/// Marshal channel store values into the model-facing vector. Scalars read
/// the committed `current` value through the linear transform
/// (`value * factor + offset`, disabled when factor == 0); binary buffers
/// are copied without consuming the store.
pub fn transform_to_model(mfc: &mut ModelFunctionChannel, sv: &mut SignalVector, channel: &mut Channel) {
    mfc.refresh_signal_map(channel);
    if mfc.is_binary {
        for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
            let data = channel.get(slot).binary.clone();
            sv.set_binary(i, &data);
        }
        return;
    }
    let scalars = sv.scalars_mut();
    match &mfc.transforms {
        Some(transforms) => {
            for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
                let value = channel.get(slot).current;
                let t = &transforms[i];
                scalars[i] = if t.factor != 0.0 {
                    value * t.factor + t.offset
                } else {
                    // Disabled (i.e. div 0), direct.
                    value
                };
            }
        }
        None => {
            for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
                scalars[i] = channel.get(slot).current;
            }
        }
    }
}

/// Marshal the model-facing vector back into the channel store. Scalars
/// invert the linear transform into the pending `final` value; binary
/// buffers replace the store content (an empty vector publishes nothing).
pub fn transform_from_model(mfc: &mut ModelFunctionChannel, sv: &mut SignalVector, channel: &mut Channel) {
    mfc.refresh_signal_map(channel);
    if mfc.is_binary {
        for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
            let store = &mut channel.get_mut(slot).binary;
            store.clear();
            store.extend_from_slice(sv.read(i));
        }
        return;
    }
    let scalars = sv.scalars();
    match &mfc.transforms {
        Some(transforms) => {
            for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
                let t = &transforms[i];
                channel.get_mut(slot).final_value = if t.factor != 0.0 {
                    (scalars[i] - t.offset) / t.factor
                } else {
                    scalars[i]
                };
            }
        }
        None => {
            for (i, &slot) in mfc.signal_map.slots.iter().enumerate() {
                channel.get_mut(slot).final_value = scalars[i];
            }
        }
    }
}
